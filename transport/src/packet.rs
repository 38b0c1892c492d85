//! Fixed 16-byte header codec for DATA and CONTROL packets.

use collections::bytes::{Reader, Writer};

use crate::error::{Result, TransportError};
use crate::msg::MsgFlags;
use crate::seq::SeqNo;

pub const HEADER_LEN: usize = 16;

/// Control-packet type field. Codes `0x7FFF` and above are
/// reserved for user-defined traffic; anything else outside the known set
/// is `UNKNOWN_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
	Handshake,
	Keepalive,
	Ack,
	LossReport,
	CongestionWarning,
	Shutdown,
	AckAck,
	DropReq,
	PeerError,
	UserDefined(u16),
}

const USER_DEFINED_BASE: u16 = 0x7FFF;

impl ControlType {
	pub fn to_u16(self) -> u16 {
		match self {
			ControlType::Handshake => 0,
			ControlType::Keepalive => 1,
			ControlType::Ack => 2,
			ControlType::LossReport => 3,
			ControlType::CongestionWarning => 4,
			ControlType::Shutdown => 5,
			ControlType::AckAck => 6,
			ControlType::DropReq => 7,
			ControlType::PeerError => 8,
			ControlType::UserDefined(ext) => ext,
		}
	}

	pub fn from_u16(v: u16) -> Result<Self> {
		Ok(match v {
			0 => ControlType::Handshake,
			1 => ControlType::Keepalive,
			2 => ControlType::Ack,
			3 => ControlType::LossReport,
			4 => ControlType::CongestionWarning,
			5 => ControlType::Shutdown,
			6 => ControlType::AckAck,
			7 => ControlType::DropReq,
			8 => ControlType::PeerError,
			ext if ext >= USER_DEFINED_BASE => ControlType::UserDefined(ext),
			other => return Err(TransportError::UnknownType(other)),
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
	pub seq: SeqNo,
	pub flags: MsgFlags,
	pub timestamp: u32,
	pub dest_id: u32,
	pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPacket {
	pub ctype: ControlType,
	/// Type-specific subheader: the ACK number an ACKACK answers, the
	/// message number a DROPREQ names, the ACK sequence counter in an ACK,
	/// and so on. Reserved/unused for types that carry no subheader value.
	pub subheader: u32,
	pub timestamp: u32,
	pub dest_id: u32,
	pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
	Data(DataPacket),
	Control(ControlPacket),
}

impl Packet {
	pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
		let mut w = Writer::new(out);
		match self {
			Packet::Data(d) => {
				w.put_u32(d.seq.get() & 0x7FFF_FFFF);
				w.put_u32(d.flags.encode());
				w.put_u32(d.timestamp);
				w.put_u32(d.dest_id);
				w.put_bytes(&d.payload);
			}
			Packet::Control(c) => {
				w.put_u32(0x8000_0000 | (u32::from(c.ctype.to_u16()) << 16));
				w.put_u32(c.subheader);
				w.put_u32(c.timestamp);
				w.put_u32(c.dest_id);
				w.put_bytes(&c.payload);
			}
		}
		Ok(w.position())
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < HEADER_LEN {
			return Err(TransportError::Malformed);
		}

		let mut r = Reader::new(buf);
		let word0 = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let word1 = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let timestamp = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let dest_id = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let payload = r.rest().to_vec();

		if word0 & 0x8000_0000 == 0 {
			Ok(Packet::Data(DataPacket {
				seq: SeqNo::new(word0 & 0x7FFF_FFFF),
				flags: MsgFlags::decode(word1),
				timestamp,
				dest_id,
				payload,
			}))
		} else {
			let ctype = ControlType::from_u16(((word0 >> 16) & 0x7FFF) as u16)?;
			Ok(Packet::Control(ControlPacket { ctype, subheader: word1, timestamp, dest_id, payload }))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msg::{BoundaryFlag, KeySlot, MsgNo};

	#[test]
	fn data_roundtrip() {
		let pkt = Packet::Data(DataPacket {
			seq: SeqNo::new(123),
			flags: MsgFlags {
				boundary: BoundaryFlag::Solo,
				order_required: true,
				key_slot: KeySlot::Even,
				rexmit: false,
				msgno: MsgNo::new(7),
			},
			timestamp: 0xDEAD_BEEF,
			dest_id: 99,
			payload: vec![1, 2, 3, 4],
		});

		let mut buf = [0u8; 64];
		let n = pkt.encode(&mut buf).unwrap();
		assert_eq!(Packet::decode(&buf[..n]).unwrap(), pkt);
	}

	#[test]
	fn control_roundtrip() {
		let pkt = Packet::Control(ControlPacket {
			ctype: ControlType::DropReq,
			subheader: 77,
			timestamp: 1,
			dest_id: 2,
			payload: vec![0, 0, 0, 10, 0, 0, 0, 20],
		});

		let mut buf = [0u8; 64];
		let n = pkt.encode(&mut buf).unwrap();
		assert_eq!(Packet::decode(&buf[..n]).unwrap(), pkt);
	}

	#[test]
	fn short_buffer_is_malformed() {
		assert_eq!(Packet::decode(&[0u8; 4]), Err(TransportError::Malformed));
	}

	#[test]
	fn unrecognized_control_type_errors() {
		let mut buf = [0u8; HEADER_LEN];
		buf[0] = 0x80; // control bit
		buf[1] = 50; // type 50, not in the known set, below USER_DEFINED_BASE
		assert_eq!(Packet::decode(&buf), Err(TransportError::UnknownType(50)));
	}

	#[test]
	fn user_defined_type_is_accepted() {
		let pkt = Packet::Control(ControlPacket {
			ctype: ControlType::UserDefined(0x7FFF),
			subheader: 0,
			timestamp: 0,
			dest_id: 0,
			payload: vec![],
		});
		let mut buf = [0u8; HEADER_LEN];
		let n = pkt.encode(&mut buf).unwrap();
		assert_eq!(Packet::decode(&buf[..n]).unwrap(), pkt);
	}
}
