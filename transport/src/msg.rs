//! Message numbers and the per-packet boundary/order/key-slot flags that
//! share the DATA packet's second header word.

use std::fmt;

/// The message-number field occupies the low 26 bits of header word 1
///; 0 is reserved, so the modulus for wrap purposes is
/// `2^26 - 1` with wraparound skipping straight from the max value to 1.
pub const MSGNO_MASK: u32 = (1 << 26) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgNo(u32);

impl MsgNo {
	pub fn new(v: u32) -> Self {
		Self(v & MSGNO_MASK)
	}

	#[inline]
	pub fn get(self) -> u32 {
		self.0
	}

	/// Next message number after `self`, wrapping `MSGNO_MASK -> 1` (0 is
	/// reserved for "no message number").
	pub fn next(self) -> Self {
		if self.0 >= MSGNO_MASK { Self(1) } else { Self(self.0 + 1) }
	}
}

impl fmt::Debug for MsgNo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "MsgNo({})", self.0)
	}
}

/// Position of a packet within its message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryFlag {
	First,
	Middle,
	Last,
	Solo,
}

impl BoundaryFlag {
	/// Two-bit wire encoding: bit1 = FIRST, bit0 = LAST (SOLO = both set).
	pub fn bits(self) -> u8 {
		match self {
			BoundaryFlag::Middle => 0b00,
			BoundaryFlag::Last => 0b01,
			BoundaryFlag::First => 0b10,
			BoundaryFlag::Solo => 0b11,
		}
	}

	pub fn from_bits(bits: u8) -> Self {
		match bits & 0b11 {
			0b00 => BoundaryFlag::Middle,
			0b01 => BoundaryFlag::Last,
			0b10 => BoundaryFlag::First,
			_ => BoundaryFlag::Solo,
		}
	}

	pub fn is_first(self) -> bool {
		matches!(self, BoundaryFlag::First | BoundaryFlag::Solo)
	}

	pub fn is_last(self) -> bool {
		matches!(self, BoundaryFlag::Last | BoundaryFlag::Solo)
	}
}

/// Which half of the key-rotation schedule encrypted this packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySlot {
	None,
	Even,
	Odd,
}

impl KeySlot {
	pub fn bits(self) -> u8 {
		match self {
			KeySlot::None => 0b00,
			KeySlot::Even => 0b01,
			KeySlot::Odd => 0b10,
		}
	}

	pub fn from_bits(bits: u8) -> Self {
		match bits & 0b11 {
			0b01 => KeySlot::Even,
			0b10 => KeySlot::Odd,
			_ => KeySlot::None,
		}
	}
}

/// The full set of bits packed alongside a DATA packet's message number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgFlags {
	pub boundary: BoundaryFlag,
	pub order_required: bool,
	pub key_slot: KeySlot,
	pub rexmit: bool,
	pub msgno: MsgNo,
}

impl MsgFlags {
	/// Packs into the 32-bit header word: `PP O KK R` then 26 bits msgno.
	pub fn encode(self) -> u32 {
		(u32::from(self.boundary.bits()) << 30)
			| (u32::from(self.order_required) << 29)
			| (u32::from(self.key_slot.bits()) << 27)
			| (u32::from(self.rexmit) << 26)
			| (self.msgno.get() & MSGNO_MASK)
	}

	pub fn decode(word: u32) -> Self {
		Self {
			boundary: BoundaryFlag::from_bits((word >> 30) as u8),
			order_required: (word >> 29) & 1 != 0,
			key_slot: KeySlot::from_bits((word >> 27) as u8),
			rexmit: (word >> 26) & 1 != 0,
			msgno: MsgNo::new(word & MSGNO_MASK),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn msgno_wraps_skipping_zero() {
		let m = MsgNo::new(MSGNO_MASK);
		assert_eq!(m.next().get(), 1);
	}

	#[test]
	fn msg_flags_roundtrip() {
		let flags = MsgFlags {
			boundary: BoundaryFlag::Solo,
			order_required: true,
			key_slot: KeySlot::Odd,
			rexmit: true,
			msgno: MsgNo::new(42),
		};
		let word = flags.encode();
		assert_eq!(MsgFlags::decode(word), flags);
	}

	#[test]
	fn boundary_bits_roundtrip() {
		for b in [BoundaryFlag::First, BoundaryFlag::Middle, BoundaryFlag::Last, BoundaryFlag::Solo] {
			assert_eq!(BoundaryFlag::from_bits(b.bits()), b);
		}
	}
}
