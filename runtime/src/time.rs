use std::time::Instant;

/// A monotonic microsecond clock anchored at its own creation.
///
/// The wire timestamp field is a 32-bit microsecond counter
/// that wraps roughly every 71.5 minutes; callers truncate `now()` to `u32`
/// themselves (see `transport::packet`) rather than this type hiding the
/// wraparound from them.
#[derive(Clone)]
pub struct Clock {
	start: Instant,
}

impl Clock {
	pub fn new() -> Self {
		Self { start: Instant::now() }
	}

	/// Microseconds elapsed since this clock was created.
	pub fn now_us(&self) -> u64 {
		self.start.elapsed().as_micros() as u64
	}

	/// `now_us`, truncated to the 32-bit wire timestamp width.
	pub fn now_us32(&self) -> u32 {
		self.now_us() as u32
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}
