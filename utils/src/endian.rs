//! Byte-order newtypes.
//!
//! The wire format is big-endian throughout. Wrapping every
//! on-the-wire integer in one of these types means a native-endian value can
//! never accidentally be written to, or read from, a packet buffer: the only
//! way in or out is through `get`/`from`, which always swaps on a
//! little-endian host and is a no-op on a big-endian one.

use core::fmt;

macro_rules! define {
	($name:ident, $int:ty) => {
		#[doc = concat!("A ", stringify!($int), " stored on the wire in big-endian byte order.")]
		#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
		#[repr(transparent)]
		pub struct $name([u8; core::mem::size_of::<$int>()]);

		impl $name {
			#[inline]
			pub const fn get(self) -> $int {
				<$int>::from_be_bytes(self.0)
			}

			#[inline]
			pub const fn new(v: $int) -> Self {
				Self(v.to_be_bytes())
			}

			#[inline]
			pub fn bytes(self) -> [u8; core::mem::size_of::<$int>()] {
				self.0
			}
		}

		impl From<$int> for $name {
			#[inline]
			fn from(v: $int) -> Self {
				Self::new(v)
			}
		}

		impl From<$name> for $int {
			#[inline]
			fn from(v: $name) -> Self {
				v.get()
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				fmt::Debug::fmt(&self.get(), f)
			}
		}
	};
}

define!(u16be, u16);
define!(u32be, u32);
define!(u64be, u64);
