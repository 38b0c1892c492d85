//! Send buffer: fragments application messages into MSS-sized blocks,
//! tracks acknowledgement, and supplies the scheduler with packets to send
//! or retransmit.

use collections::sparse::ring::Ring;

use crate::msg::{BoundaryFlag, MsgNo};
use crate::seq::SeqNo;

#[derive(Clone, Debug)]
pub struct Block {
	pub payload: Vec<u8>,
	pub seq: SeqNo,
	pub msgno: MsgNo,
	pub boundary: BoundaryFlag,
	pub order_required: bool,
	pub enqueue_time_us: u64,
	pub src_time_us: Option<u64>,
	pub ttl_ms: i64,
}

pub enum ReadOutcome {
	Packet(Block),
	Empty,
	/// The whole message this block belonged to has aged past its TTL;
	/// the caller must emit a DROPREQ naming `msgno`.
	Expired { msgno: MsgNo, packets: u32 },
}

const GROW_CHUNK: usize = 256;

pub struct SendBuffer {
	ring: Ring<Block>,
	mss: usize,
	start_seq: SeqNo,
	next_msgno: MsgNo,
	next_logical: usize,
	/// First not-yet-acknowledged logical index; blocks before this are
	/// reclaimable.
	first_unacked: usize,
	/// Next logical index the scheduler has not yet been offered.
	next_to_send: usize,
	input_rate_bps: f64,
}

fn ttl_expired(now_us: u64, enqueue_time_us: u64, ttl_ms: i64) -> bool {
	ttl_ms > 0 && ((now_us - enqueue_time_us) / 1000) as i64 > ttl_ms
}

impl SendBuffer {
	pub fn new(capacity: usize, mss: usize, start_seq: SeqNo) -> Self {
		Self {
			ring: Ring::new(capacity),
			mss,
			start_seq,
			next_msgno: MsgNo::new(1),
			next_logical: 0,
			first_unacked: 0,
			next_to_send: 0,
			input_rate_bps: 0.0,
		}
	}

	fn seq_of(&self, logical: usize) -> SeqNo {
		self.start_seq.add_offset(logical as i64)
	}

	/// Offset past `first_unacked` for a sequence the peer reported lost,
	/// or `None` if it has already been acknowledged and reclaimed.
	pub fn retransmit_offset(&self, seq: SeqNo) -> Option<u32> {
		let logical = seq.diff_signed(self.start_seq);
		if logical < 0 {
			return None;
		}
		let logical = logical as usize;
		if logical < self.first_unacked || logical >= self.next_logical {
			return None;
		}
		Some((logical - self.first_unacked) as u32)
	}

	fn ensure_capacity(&mut self, extra_blocks: usize) {
		let in_use = self.next_logical - self.first_unacked;
		if in_use + extra_blocks > self.ring.capacity() {
			self.ring.grow(GROW_CHUNK.max(extra_blocks));
		}
	}

	/// Splits `bytes` into `ceil(len / mss)` blocks, assigns a fresh
	/// message number, and returns it with the first assigned sequence
	/// number.
	pub fn enqueue(
		&mut self,
		bytes: &[u8],
		ttl_ms: i64,
		order_required: bool,
		src_time_us: Option<u64>,
		now_us: u64,
	) -> (MsgNo, SeqNo) {
		let chunks: Vec<&[u8]> = bytes.chunks(self.mss).collect();
		let chunks = if chunks.is_empty() { vec![&bytes[..0]] } else { chunks };
		self.ensure_capacity(chunks.len());

		let msgno = self.next_msgno;
		self.next_msgno = self.next_msgno.next();
		let first_seq = self.seq_of(self.next_logical);
		let n = chunks.len();

		for (i, chunk) in chunks.into_iter().enumerate() {
			let boundary = match (i == 0, i == n - 1) {
				(true, true) => BoundaryFlag::Solo,
				(true, false) => BoundaryFlag::First,
				(false, true) => BoundaryFlag::Last,
				(false, false) => BoundaryFlag::Middle,
			};
			let logical = self.next_logical;
			let block = Block {
				payload: chunk.to_vec(),
				seq: self.seq_of(logical),
				msgno,
				boundary,
				order_required,
				enqueue_time_us: now_us,
				src_time_us,
				ttl_ms,
			};
			self.ring.insert(logical, block);
			self.next_logical += 1;
		}

		let total_bytes = bytes.len() as f64;
		self.input_rate_bps += (total_bytes - self.input_rate_bps) / 16.0;

		(msgno, first_seq)
	}

	/// Obtains the next not-yet-sent block for the scheduler, advancing
	/// the send cursor. Drops (and reports) a block whose message has
	/// expired by TTL instead of sending it.
	pub fn read_next(&mut self, now_us: u64) -> ReadOutcome {
		if self.next_to_send >= self.next_logical {
			return ReadOutcome::Empty;
		}
		let logical = self.next_to_send;
		let block = match self.ring.get(logical) {
			Some(b) => b.clone(),
			None => {
				self.next_to_send += 1;
				return ReadOutcome::Empty;
			}
		};

		if ttl_expired(now_us, block.enqueue_time_us, block.ttl_ms) {
			let packets = self.expire_message(block.msgno);
			return ReadOutcome::Expired { msgno: block.msgno, packets };
		}

		self.next_to_send += 1;
		ReadOutcome::Packet(block)
	}

	/// Fetches the block at `offset` past the first-unacknowledged
	/// pointer, for retransmission.
	pub fn read_retransmit(&mut self, offset: u32, now_us: u64) -> ReadOutcome {
		let logical = self.first_unacked + offset as usize;
		if logical >= self.next_logical {
			return ReadOutcome::Empty;
		}
		let block = match self.ring.get(logical) {
			Some(b) => b.clone(),
			None => return ReadOutcome::Empty,
		};

		if ttl_expired(now_us, block.enqueue_time_us, block.ttl_ms) {
			let packets = self.expire_message(block.msgno);
			return ReadOutcome::Expired { msgno: block.msgno, packets };
		}

		ReadOutcome::Packet(block)
	}

	fn expire_message(&mut self, msgno: MsgNo) -> u32 {
		let mut count = 0;
		for logical in self.first_unacked..self.next_logical {
			let hit = matches!(self.ring.get(logical), Some(b) if b.msgno == msgno);
			if hit {
				self.ring.remove(logical);
				count += 1;
			}
		}
		count
	}

	/// Advances first-unacknowledged up to (not including) `seq`, the
	/// "lowest unacknowledged sequence" carried in an ACK payload. Returns the number of blocks freed.
	pub fn ack_upto(&mut self, seq: SeqNo) -> u32 {
		let cur = self.seq_of(self.first_unacked);
		let n = SeqNo::range_len(cur, seq).min(self.unacked_count());
		if n > 0 {
			self.ack(n);
		}
		n
	}

	/// Advances first-unacknowledged by `n` blocks, freeing them.
	pub fn ack(&mut self, n: u32) {
		for logical in self.first_unacked..self.first_unacked + n as usize {
			self.ring.remove(logical);
		}
		self.first_unacked += n as usize;
		self.next_to_send = self.next_to_send.max(self.first_unacked);
	}

	/// Reclaims blocks older than `cutoff_time_us` from the head.
	pub fn drop_late(&mut self, cutoff_time_us: u64) -> u32 {
		let mut dropped = 0;
		while self.first_unacked < self.next_logical {
			match self.ring.get(self.first_unacked) {
				Some(b) if b.enqueue_time_us < cutoff_time_us => {
					self.ring.remove(self.first_unacked);
					self.first_unacked += 1;
					dropped += 1;
				}
				_ => break,
			}
		}
		self.next_to_send = self.next_to_send.max(self.first_unacked);
		dropped
	}

	pub fn current_input_rate(&self) -> f64 {
		self.input_rate_bps
	}

	pub fn in_flight(&self) -> u32 {
		(self.next_to_send - self.first_unacked) as u32
	}

	pub fn unacked_count(&self) -> u32 {
		(self.next_logical - self.first_unacked) as u32
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn enqueue_splits_into_mss_blocks() {
		let mut buf = SendBuffer::new(64, 4, SeqNo::new(0));
		let (msgno, first_seq) = buf.enqueue(b"abcdefgh", 0, true, None, 0);
		assert_eq!(first_seq.get(), 0);
		assert_eq!(msgno.get(), 1);

		let ReadOutcome::Packet(b0) = buf.read_next(0) else { panic!() };
		assert_eq!(b0.boundary, BoundaryFlag::First);
		let ReadOutcome::Packet(b1) = buf.read_next(0) else { panic!() };
		assert_eq!(b1.boundary, BoundaryFlag::Last);
		assert!(matches!(buf.read_next(0), ReadOutcome::Empty));
	}

	#[test]
	fn ack_frees_blocks_and_advances_first_unacked() {
		let mut buf = SendBuffer::new(64, 100, SeqNo::new(0));
		buf.enqueue(b"hello", 0, true, None, 0);
		buf.enqueue(b"world", 0, true, None, 0);
		assert!(matches!(buf.read_next(0), ReadOutcome::Packet(_)));
		assert!(matches!(buf.read_next(0), ReadOutcome::Packet(_)));
		buf.ack(2);
		assert_eq!(buf.unacked_count(), 0);
	}

	#[test]
	fn ttl_expiry_reports_whole_message() {
		let mut buf = SendBuffer::new(64, 100, SeqNo::new(0));
		buf.enqueue(b"stale", 10, true, None, 0);
		match buf.read_next(1_000_000) {
			ReadOutcome::Expired { packets, .. } => assert_eq!(packets, 1),
			_ => panic!("expected expiry"),
		}
	}

	#[test]
	fn drop_late_reclaims_old_blocks() {
		let mut buf = SendBuffer::new(64, 100, SeqNo::new(0));
		buf.enqueue(b"old", 0, true, None, 0);
		buf.enqueue(b"new", 0, true, None, 5_000);
		let dropped = buf.drop_late(1_000);
		assert_eq!(dropped, 1);
	}
}
