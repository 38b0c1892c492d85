//! Property checks for the sender loss list: arbitrary insert/remove
//! interleavings must keep the ranges disjoint, ascending, and internally
//! consistent with `len()`.

use proptest::prelude::*;

use transport::loss::SndLossList;
use transport::seq::SeqNo;

#[derive(Clone, Copy, Debug)]
enum Op {
	Insert(u32, u8),
	Remove(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u32..2000, 0u8..20).prop_map(|(a, len)| Op::Insert(a, len)),
		(0u32..2000).prop_map(Op::Remove),
	]
}

proptest! {
	#[test]
	fn snd_loss_list_stays_sorted_and_disjoint(ops in prop::collection::vec(op_strategy(), 0..200)) {
		let mut list = SndLossList::new();
		for op in ops {
			match op {
				Op::Insert(first, len) => {
					let first = SeqNo::new(first);
					let last = first.add_offset(len as i64);
					list.insert(first, last);
				}
				Op::Remove(seq) => list.remove(SeqNo::new(seq)),
			}
		}

		// Re-derive the range list the only way the public API allows:
		// pop everything off and check it comes out non-decreasing with
		// no repeats, and that the count matches `len()`.
		let reported_len = list.len();
		let mut popped = 0u32;
		let mut prev: Option<SeqNo> = None;
		while let Some(seq) = list.pop() {
			if let Some(p) = prev {
				prop_assert!(seq.diff_signed(p) > 0, "loss list produced a non-increasing sequence");
			}
			prev = Some(seq);
			popped += 1;
		}
		prop_assert_eq!(popped, reported_len);
	}

	#[test]
	fn insert_then_remove_every_element_empties_the_list(first in 0u32..2000, len in 0u8..50) {
		let mut list = SndLossList::new();
		let first = SeqNo::new(first);
		let last = first.add_offset(len as i64);
		list.insert(first, last);

		let mut cur = first;
		loop {
			list.remove(cur);
			if cur == last {
				break;
			}
			cur = cur.increment();
		}
		prop_assert!(list.is_empty());
	}
}
