//! The fixed-size packet-slot pool shared by every receive buffer on one
//! multiplexer.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use collections::sparse::slab::Slab;

/// Large enough for one maximum segment at the default MSS.
pub const UNIT_SIZE: usize = 1500;

#[derive(Clone)]
pub struct Unit {
	pub buf: [u8; UNIT_SIZE],
	pub len: usize,
}

impl Unit {
	fn empty() -> Self {
		Self { buf: [0u8; UNIT_SIZE], len: 0 }
	}

	pub fn bytes(&self) -> &[u8] {
		&self.buf[..self.len]
	}

	pub fn fill(&mut self, data: &[u8]) {
		debug_assert!(data.len() <= UNIT_SIZE, "payload exceeds unit size");
		self.len = data.len();
		self.buf[..data.len()].copy_from_slice(data);
	}
}

/// Grow when occupancy crosses this fraction.
const GROW_THRESHOLD: f64 = 0.9;

pub struct UnitPool {
	slab: Mutex<Slab<Unit>>,
	occupancy_pct: AtomicUsize,
	grow_chunk: usize,
}

impl UnitPool {
	pub fn new(initial_capacity: usize, grow_chunk: usize) -> Self {
		Self {
			slab: Mutex::new(Slab::with_capacity(initial_capacity, Unit::empty)),
			occupancy_pct: AtomicUsize::new(0),
			grow_chunk,
		}
	}

	/// Cheap cross-thread observable: the pool's occupancy as a percentage,
	/// the only value a thread other than the receive worker reads without
	/// taking the free-list mutex.
	pub fn occupancy_pct(&self) -> usize {
		self.occupancy_pct.load(Ordering::Relaxed)
	}

	/// Acquires a free slot, growing the pool first if occupancy is over
	/// the threshold. Called only from the receive worker.
	pub fn acquire(&self) -> Option<usize> {
		let mut slab = self.slab.lock().unwrap();
		if slab.occupancy() > GROW_THRESHOLD {
			slab.grow(self.grow_chunk, Unit::empty);
		}
		let idx = slab.acquire();
		self.occupancy_pct.store((slab.occupancy() * 100.0) as usize, Ordering::Relaxed);
		idx
	}

	/// Marks a slot free. Callable from any thread.
	pub fn release(&self, idx: usize) {
		let mut slab = self.slab.lock().unwrap();
		slab.release(idx);
		self.occupancy_pct.store((slab.occupancy() * 100.0) as usize, Ordering::Relaxed);
	}

	pub fn write(&self, idx: usize, data: &[u8]) {
		self.slab.lock().unwrap().get_mut(idx).fill(data);
	}

	pub fn read(&self, idx: usize) -> Vec<u8> {
		self.slab.lock().unwrap().get(idx).bytes().to_vec()
	}

	/// Reads one datagram directly into slot `idx`'s buffer, avoiding the
	/// extra copy `write` would need. Called only from the receive worker.
	pub fn recv_into(&self, idx: usize, socket: &UdpSocket) -> std::io::Result<(usize, SocketAddr)> {
		let mut slab = self.slab.lock().unwrap();
		let unit = slab.get_mut(idx);
		let (n, addr) = socket.recv_from(&mut unit.buf)?;
		unit.len = n;
		Ok((n, addr))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_write_read_release() {
		let pool = UnitPool::new(4, 4);
		let idx = pool.acquire().unwrap();
		pool.write(idx, b"hello");
		assert_eq!(pool.read(idx), b"hello");
		pool.release(idx);
	}

	#[test]
	fn grows_past_threshold() {
		let pool = UnitPool::new(2, 4);
		let _a = pool.acquire().unwrap();
		let _b = pool.acquire().unwrap();
		// occupancy is now 100% > 90%, so the next acquire grows first.
		let c = pool.acquire();
		assert!(c.is_some());
	}
}
