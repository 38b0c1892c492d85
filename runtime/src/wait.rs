use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A wake-on-demand gate for a worker thread that otherwise sleeps until a
/// deadline it computes itself.
///
/// A thread blocks in `wait_until`, and any other thread that changes
/// state the worker cares about (a new packet queued, a loss reported,
/// the socket closing) calls `notify` to cut the sleep short rather than
/// wait for the deadline.
pub struct Gate {
	woken: Mutex<bool>,
	cv: Condvar,
}

impl Gate {
	pub fn new() -> Self {
		Self { woken: Mutex::new(false), cv: Condvar::new() }
	}

	/// Sleeps until `deadline` or until `notify` is called, whichever comes
	/// first. Returns `true` if woken by `notify`, `false` on timeout.
	pub fn wait_until(&self, deadline: Instant) -> bool {
		let now = Instant::now();
		if deadline <= now {
			return self.take();
		}

		let guard = self.woken.lock().unwrap();
		let (guard, timeout) =
			self.cv.wait_timeout(guard, deadline - now).unwrap();
		drop(timeout);
		let mut guard = guard;
		if *guard {
			*guard = false;
			true
		} else {
			false
		}
	}

	/// Sleeps indefinitely until `notify` is called.
	pub fn wait(&self) {
		let mut guard = self.woken.lock().unwrap();
		while !*guard {
			guard = self.cv.wait(guard).unwrap();
		}
		*guard = false;
	}

	/// Sleeps for at most `dur`. Returns `true` if woken by `notify`.
	pub fn wait_for(&self, dur: Duration) -> bool {
		self.wait_until(Instant::now() + dur)
	}

	fn take(&self) -> bool {
		let mut guard = self.woken.lock().unwrap();
		if *guard {
			*guard = false;
			true
		} else {
			false
		}
	}

	/// Wakes a thread blocked in `wait`/`wait_until`/`wait_for`, or arms the
	/// gate so the next such call returns immediately.
	pub fn notify(&self) {
		*self.woken.lock().unwrap() = true;
		self.cv.notify_all();
	}
}

impl Default for Gate {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn notify_wakes_waiter() {
		let gate = Arc::new(Gate::new());
		let g2 = gate.clone();
		let t = thread::spawn(move || {
			g2.wait();
		});

		thread::sleep(Duration::from_millis(10));
		gate.notify();
		t.join().unwrap();
	}

	#[test]
	fn wait_until_times_out() {
		let gate = Gate::new();
		let woken = gate.wait_until(Instant::now() + Duration::from_millis(5));
		assert!(!woken);
	}
}
