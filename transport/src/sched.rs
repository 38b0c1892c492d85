//! The sender scheduler: a time-ordered min-heap of connections awaiting
//! their next send slot, guarded by a mutex and condition variable, with
//! a single-shot timer to interrupt the worker when an earlier entry is
//! inserted at the head.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use runtime::wait::Gate;
use runtime::Clock;

struct Inner<Id: Eq + Hash + Copy + Ord> {
	heap: BinaryHeap<Reverse<(u64, Id)>>,
	scheduled: HashMap<Id, u64>,
}

/// `Id` identifies a connection without this module needing to know
/// anything about `conn::Connection` itself.
pub struct Scheduler<Id: Eq + Hash + Copy + Ord> {
	inner: Mutex<Inner<Id>>,
	gate: Gate,
	closed: AtomicBool,
}

impl<Id: Eq + Hash + Copy + Ord> Scheduler<Id> {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner { heap: BinaryHeap::new(), scheduled: HashMap::new() }),
			gate: Gate::new(),
			closed: AtomicBool::new(false),
		}
	}

	/// Permanently unblocks every `pop_blocking` waiter, used for
	/// multiplexer shutdown.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.gate.notify();
	}

	/// Inserts `id` at `now_us` if it isn't already scheduled, or
	/// reschedules it to `now_us` if `reschedule` is set (used for
	/// high-priority control packets that must jump the queue).
	pub fn update(&self, id: Id, now_us: u64, reschedule: bool) {
		let mut inner = self.inner.lock().unwrap();
		let already = inner.scheduled.contains_key(&id);
		if !already || reschedule {
			inner.scheduled.insert(id, now_us);
			inner.heap.push(Reverse((now_us, id)));
		}
		drop(inner);
		self.gate.notify();
	}

	/// Drops `id` from the schedule, e.g. on connection teardown. The
	/// stale heap entry (if any) is skipped lazily by `pop_blocking`.
	pub fn remove(&self, id: Id) {
		self.inner.lock().unwrap().scheduled.remove(&id);
	}

	pub fn is_scheduled(&self, id: Id) -> bool {
		self.inner.lock().unwrap().scheduled.contains_key(&id)
	}

	/// Waits for the head entry's scheduled time to pass, then pops and
	/// returns it. Returns `None` if `close` was signaled via `gate`
	/// while waiting and the heap is empty. The caller is expected to
	/// call `update` again afterwards if the connection still has data
	/// queued.
	pub fn pop_blocking(&self, clock: &Clock) -> Option<Id> {
		loop {
			if self.closed.load(Ordering::Acquire) {
				return None;
			}
			let now = clock.now_us();
			let head = { self.inner.lock().unwrap().heap.peek().map(|Reverse((t, _))| *t) };

			match head {
				None => {
					self.gate.wait_for(Duration::from_millis(50));
				}
				Some(t) if t <= now => {
					let mut inner = self.inner.lock().unwrap();
					while let Some(Reverse((t2, id))) = inner.heap.pop() {
						if inner.scheduled.get(&id) == Some(&t2) {
							inner.scheduled.remove(&id);
							return Some(id);
						}
					}
				}
				Some(t) => {
					self.gate.wait_for(Duration::from_micros(t - now));
				}
			}
		}
	}

	/// Wakes a thread blocked in `pop_blocking` without scheduling
	/// anything, e.g. to let it notice a closed multiplexer.
	pub fn wake(&self) {
		self.gate.notify();
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().scheduled.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<Id: Eq + Hash + Copy + Ord> Default for Scheduler<Id> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pop_returns_earliest_due_entry() {
		let sched: Scheduler<u32> = Scheduler::new();
		let clock = Clock::new();
		let now = clock.now_us();
		sched.update(2, now, false);
		sched.update(1, now, false);
		// both already due; heap orders by (time, id), so 1 pops first
		assert_eq!(sched.pop_blocking(&clock), Some(1));
		assert_eq!(sched.pop_blocking(&clock), Some(2));
	}

	#[test]
	fn remove_skips_stale_entry() {
		let sched: Scheduler<u32> = Scheduler::new();
		let clock = Clock::new();
		let now = clock.now_us();
		sched.update(1, now, false);
		sched.update(2, now, false);
		sched.remove(1);
		assert_eq!(sched.pop_blocking(&clock), Some(2));
	}

	#[test]
	fn reschedule_moves_entry_to_new_time() {
		let sched: Scheduler<u32> = Scheduler::new();
		let clock = Clock::new();
		let now = clock.now_us();
		sched.update(1, now, false);
		sched.update(1, now, true); // reschedule: still due now, no duplicate pop
		assert_eq!(sched.pop_blocking(&clock), Some(1));
		assert!(!sched.is_scheduled(1));
	}
}
