use utils::endian::{u16be, u32be, u64be};

/// A cursor over a mutable byte buffer, used to pack wire-format packets.
///
/// Mirrors the pivot-advancing cursor idiom used for every on-the-wire
/// structure in this workspace: each `put_*` call writes at the current
/// position and advances it, so a packet is built by a straight-line chain
/// of calls rather than manual index bookkeeping.
pub struct Writer<'a> {
	buf: &'a mut [u8],
	pos: usize,
}

impl<'a> Writer<'a> {
	pub fn new(buf: &'a mut [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	#[inline]
	pub fn position(&self) -> usize {
		self.pos
	}

	#[inline]
	pub fn remaining(&self) -> usize {
		self.buf.len() - self.pos
	}

	#[inline]
	pub fn put_u8(&mut self, v: u8) {
		self.buf[self.pos] = v;
		self.pos += 1;
	}

	#[inline]
	pub fn put_u16(&mut self, v: u16) {
		self.put_bytes(&u16be::new(v).bytes());
	}

	#[inline]
	pub fn put_u32(&mut self, v: u32) {
		self.put_bytes(&u32be::new(v).bytes());
	}

	#[inline]
	pub fn put_u64(&mut self, v: u64) {
		self.put_bytes(&u64be::new(v).bytes());
	}

	#[inline]
	pub fn put_bytes(&mut self, v: &[u8]) {
		self.buf[self.pos..][..v.len()].copy_from_slice(v);
		self.pos += v.len();
	}

	/// Returns the whole buffer written so far.
	#[inline]
	pub fn written(&self) -> &[u8] {
		&self.buf[..self.pos]
	}

	/// Returns a writer over the tail `len` bytes of the underlying buffer,
	/// independent of `self`'s own position. Used to append a trailing
	/// authentication tag after the body has been written.
	pub fn tail(&mut self, len: usize) -> Writer<'_> {
		let n = self.buf.len();
		Writer::new(&mut self.buf[n - len..])
	}
}
