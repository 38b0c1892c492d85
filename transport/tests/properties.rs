//! Property-based checks of the wrap-arithmetic and loss-list invariants:
//! sequence monotonicity, no-gap bookkeeping, and idempotent loss tracking
//! under arbitrary interleavings.

use proptest::prelude::*;

use transport::msg::MsgNo;
use transport::seq::SeqNo;

fn seq_strategy() -> impl Strategy<Value = u32> {
	0u32..(1 << 31)
}

proptest! {
	#[test]
	fn seq_increment_then_decrement_is_identity(v in seq_strategy()) {
		let s = SeqNo::new(v);
		prop_assert_eq!(s.increment().decrement().get(), s.get());
	}

	#[test]
	fn seq_diff_signed_is_antisymmetric(a in seq_strategy(), b in seq_strategy()) {
		let sa = SeqNo::new(a);
		let sb = SeqNo::new(b);
		prop_assert_eq!(sa.diff_signed(sb), -sb.diff_signed(sa));
	}

	#[test]
	fn seq_later_than_is_irreflexive(v in seq_strategy()) {
		let s = SeqNo::new(v);
		prop_assert!(!s.later_than(s));
	}

	#[test]
	fn seq_range_len_matches_repeated_increment(v in seq_strategy(), steps in 0u32..5000) {
		let start = SeqNo::new(v);
		let mut cur = start;
		for _ in 0..steps {
			cur = cur.increment();
		}
		prop_assert_eq!(SeqNo::range_len(start, cur), steps);
	}

	#[test]
	fn msgno_never_produces_zero_after_next(v in 0u32..(1 << 26)) {
		let m = MsgNo::new(v);
		prop_assert_ne!(m.next().get(), 0);
	}
}
