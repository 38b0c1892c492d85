use utils::error::Result;

/// A cursor over an immutable byte buffer, used to parse wire-format packets.
///
/// Every `get_*` call fails the whole parse with `Err(())` rather than
/// panicking when the buffer is shorter than expected; `transport::packet`
/// turns that into the `MALFORMED` codec error.
pub struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	#[inline]
	pub fn remaining(&self) -> usize {
		self.buf.len() - self.pos
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		if self.remaining() < n {
			return Err(());
		}

		let out = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(out)
	}

	#[inline]
	pub fn get_u8(&mut self) -> Result<u8> {
		Ok(self.take(1)?[0])
	}

	#[inline]
	pub fn get_u16(&mut self) -> Result<u16> {
		Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
	}

	#[inline]
	pub fn get_u32(&mut self) -> Result<u32> {
		Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
	}

	#[inline]
	pub fn get_u64(&mut self) -> Result<u64> {
		Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
	}

	/// Returns the remainder of the buffer without consuming it.
	#[inline]
	pub fn rest(&self) -> &'a [u8] {
		&self.buf[self.pos..]
	}

	/// Consumes and returns exactly `n` bytes.
	#[inline]
	pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
		self.take(n)
	}
}
