//! Receive buffer: reorders arriving packets, reassembles messages, and
//! (in TSBPD mode) enforces playout time with clock-drift compensation
//!.

use collections::sparse::ring::Ring;

use crate::error::{Result, TransportError};
use crate::msg::{BoundaryFlag, MsgFlags, MsgNo};
use crate::seq::SeqNo;

const DRIFT_SAMPLES: usize = 1000;
const DRIFT_MAX_US: i64 = 5000;
const WRAP_PERIOD_US: u64 = 1u64 << 32;
const WRAP_CHECK_US: u64 = 30_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellState {
	Good,
	PassAck,
	Dropped,
}

#[derive(Clone, Debug)]
struct Cell {
	state: CellState,
	flags: MsgFlags,
	timestamp: u32,
	payload: Vec<u8>,
	notch: usize,
}

/// Extends the wrapping 32-bit wire timestamp into a monotonic 64-bit one
/// by tracking how many times it has wrapped past `u32::MAX`.
struct TsWrap {
	in_check: bool,
	added_this_wrap: bool,
	periods: u64,
}

impl TsWrap {
	fn new() -> Self {
		Self { in_check: false, added_this_wrap: false, periods: 0 }
	}

	fn extend(&mut self, raw_ts: u32) -> u64 {
		let raw = raw_ts as u64;
		if !self.in_check {
			if raw > WRAP_PERIOD_US - WRAP_CHECK_US {
				self.in_check = true;
				self.added_this_wrap = false;
			}
		} else if raw < WRAP_CHECK_US {
			if !self.added_this_wrap {
				self.periods += 1;
				self.added_this_wrap = true;
			}
		} else if raw < 2 * WRAP_CHECK_US {
			self.in_check = false;
		}
		self.periods * WRAP_PERIOD_US + raw
	}
}

struct DriftTracker {
	samples: Vec<i64>,
}

impl DriftTracker {
	fn new() -> Self {
		Self { samples: Vec::with_capacity(DRIFT_SAMPLES) }
	}

	/// Returns `Some(shift)` once `DRIFT_SAMPLES` samples have accumulated
	/// and their average exceeds `DRIFT_MAX_US`.
	fn sample(&mut self, drift_us: i64) -> Option<i64> {
		self.samples.push(drift_us);
		if self.samples.len() < DRIFT_SAMPLES {
			return None;
		}
		let avg = self.samples.iter().sum::<i64>() / self.samples.len() as i64;
		self.samples.clear();
		if avg.abs() > DRIFT_MAX_US { Some(avg) } else { None }
	}
}

const GROW_CHUNK: usize = 256;

pub struct ReceiveBuffer {
	ring: Ring<Cell>,
	base_seq: SeqNo,
	start_pos: usize,
	last_ack_pos: usize,
	max_pos: usize,
	highest_seen: Option<usize>,
	tsbpd_mode: bool,
	tsbpd_delay_us: u64,
	tsbpd_base_us: i64,
	ts_wrap: TsWrap,
	drift: DriftTracker,
	decrypt_failures: u64,
}

impl ReceiveBuffer {
	pub fn new(capacity: usize, base_seq: SeqNo, tsbpd_mode: bool, tsbpd_delay_us: u64, tsbpd_base_us: i64) -> Self {
		Self {
			ring: Ring::new(capacity),
			base_seq,
			start_pos: 0,
			last_ack_pos: 0,
			max_pos: 0,
			highest_seen: None,
			tsbpd_mode,
			tsbpd_delay_us,
			tsbpd_base_us,
			ts_wrap: TsWrap::new(),
			drift: DriftTracker::new(),
			decrypt_failures: 0,
		}
	}

	fn ensure_capacity(&mut self, logical: usize) {
		while logical >= self.start_pos + self.ring.capacity() {
			self.ring.grow(GROW_CHUNK);
		}
	}

	/// Inserts an arrived packet. Fails with `DUPLICATE` if its cell is
	/// already occupied or if it is older than `start_pos`.
	pub fn insert(&mut self, seq: SeqNo, flags: MsgFlags, timestamp: u32, payload: Vec<u8>) -> Result<()> {
		let offset = seq.diff_signed(self.base_seq.add_offset(self.start_pos as i64));
		if offset < 0 {
			return Err(TransportError::Duplicate);
		}
		let logical = self.start_pos + offset as usize;
		self.ensure_capacity(logical);
		if self.ring.contains(logical) {
			return Err(TransportError::Duplicate);
		}

		self.ring.insert(logical, Cell { state: CellState::Good, flags, timestamp, payload, notch: 0 });
		self.highest_seen = Some(self.highest_seen.map_or(logical, |h| h.max(logical)));
		self.recount_max_pos();
		Ok(())
	}

	/// The highest sequence number inserted so far, or `None` if the buffer
	/// has never received a packet.
	pub fn highest_seen_seq(&self) -> Option<SeqNo> {
		self.highest_seen.map(|h| self.base_seq.add_offset(h as i64))
	}

	/// Number of cells contiguously occupied starting at `last_ack_pos`,
	/// i.e. how far `ack` can safely advance right now.
	pub fn contiguous_ready(&self) -> u32 {
		let mut n = 0;
		while self.ring.contains(self.last_ack_pos + n) {
			n += 1;
		}
		n as u32
	}

	fn recount_max_pos(&mut self) {
		let highest = self.highest_seen.unwrap_or(0);
		self.max_pos = if highest >= self.last_ack_pos { highest - self.last_ack_pos } else { 0 };
	}

	/// Advances `last_ack_pos` by `n`.
	pub fn ack(&mut self, n: u32) {
		self.last_ack_pos += n as usize;
		self.recount_max_pos();
	}

	pub fn start_pos(&self) -> usize {
		self.start_pos
	}

	pub fn last_ack_pos(&self) -> usize {
		self.last_ack_pos
	}

	pub fn max_pos(&self) -> usize {
		self.max_pos
	}

	/// The lowest sequence not yet continuously received, carried as the
	/// mandatory field of an outgoing ACK.
	pub fn last_ack_seq(&self) -> SeqNo {
		self.base_seq.add_offset(self.last_ack_pos as i64)
	}

	/// Stream-mode extraction: copies up to `dest.len()` bytes starting at
	/// `start_pos`, honoring a partially-read cell's notch.
	pub fn read_into(&mut self, dest: &mut [u8]) -> usize {
		let mut written = 0;
		while written < dest.len() && self.start_pos < self.last_ack_pos {
			let done = {
				let cell = match self.ring.get_mut(self.start_pos) {
					Some(c) => c,
					None => {
						self.start_pos += 1;
						continue;
					}
				};
				let avail = &cell.payload[cell.notch..];
				let n = avail.len().min(dest.len() - written);
				dest[written..written + n].copy_from_slice(&avail[..n]);
				cell.notch += n;
				written += n;
				cell.notch >= cell.payload.len()
			};
			if done {
				self.ring.remove(self.start_pos);
				self.start_pos += 1;
			} else {
				break;
			}
		}
		written
	}

	fn playout_time_us(&mut self, raw_ts: u32) -> i64 {
		let extended = self.ts_wrap.extend(raw_ts) as i64;
		self.tsbpd_base_us + extended + self.tsbpd_delay_us as i64
	}

	/// Playout time of the first good packet, or `0` if none.
	pub fn first_ready_time(&mut self) -> i64 {
		match self.ring.get(self.start_pos) {
			Some(c) if c.state == CellState::Good => {
				let ts = c.timestamp;
				self.playout_time_us(ts)
			}
			_ => 0,
		}
	}

	/// Message-mode extraction: finds a contiguous run of `Good` cells
	/// from `start_pos` bounded by FIRST/SOLO..LAST/SOLO and delivers it.
	/// In TSBPD mode, also requires the first unit's playout time to have
	/// arrived. Returns the number of bytes written, or 0 if no complete,
	/// due message is available.
	pub fn read_message(&mut self, dest: &mut Vec<u8>, now_us: i64) -> usize {
		if self.start_pos >= self.last_ack_pos {
			return 0;
		}

		let first = match self.ring.get(self.start_pos) {
			Some(c) if c.state != CellState::Dropped => c,
			Some(_) => {
				// A dropped leading cell is skipped so the next message
				// isn't blocked behind it forever.
				self.ring.remove(self.start_pos);
				self.start_pos += 1;
				return self.read_message(dest, now_us);
			}
			None => return 0,
		};
		if !first.flags.boundary.is_first() {
			return 0;
		}

		if self.tsbpd_mode {
			let ts = first.timestamp;
			if self.playout_time_us(ts) > now_us {
				return 0;
			}
		}

		let mut end = self.start_pos;
		loop {
			if end >= self.last_ack_pos {
				return 0; // message incomplete, holes still open
			}
			match self.ring.get(end) {
				Some(c) if c.flags.boundary.is_last() => break,
				Some(_) => end += 1,
				None => return 0,
			}
		}

		for logical in self.start_pos..=end {
			if let Some(c) = self.ring.get(logical) {
				if c.state != CellState::Dropped {
					dest.extend_from_slice(&c.payload);
				}
			}
			self.ring.remove(logical);
		}
		self.start_pos = end + 1;
		dest.len()
	}

	/// Samples the clock-drift estimate on an ACKACK round trip.
	pub fn on_ackack(&mut self, peer_timestamp_raw: u32, now_us: i64) {
		let extended = self.ts_wrap.extend(peer_timestamp_raw) as i64;
		let drift = now_us - (self.tsbpd_base_us + extended);
		if let Some(shift) = self.drift.sample(drift) {
			self.tsbpd_base_us += shift;
		}
	}

	/// Marks every cell holding `msgno` as dropped.
	pub fn drop_message(&mut self, msgno: MsgNo) {
		let Some(highest_seen) = self.highest_seen else { return };
		for logical in self.start_pos..=highest_seen {
			let hit = matches!(self.ring.get(logical), Some(c) if c.flags.msgno == msgno);
			if hit {
				if let Some(c) = self.ring.get_mut(logical) {
					c.state = CellState::Dropped;
					c.payload.clear();
				}
			}
		}
	}

	/// Advances `start_pos` past any cells up to but not including `seq`,
	/// freeing their units.
	pub fn drop_upto(&mut self, seq: SeqNo) {
		let target = self.base_seq.add_offset(self.start_pos as i64);
		let n = SeqNo::range_len(target, seq) as usize;
		for logical in self.start_pos..self.start_pos + n {
			self.ring.remove(logical);
		}
		self.start_pos += n;
		self.last_ack_pos = self.last_ack_pos.max(self.start_pos);
		self.recount_max_pos();
	}

	/// TLPKTDROP: if TSBPD is enabled and the packet due at `start_pos` is
	/// still missing while a later, already-buffered packet's own playout
	/// deadline has already passed, skip ahead to that packet instead of
	/// stalling delivery on the gap forever. Returns whether it skipped.
	pub fn tsbpd_late_drop(&mut self, now_us: i64) -> bool {
		if !self.tsbpd_mode || self.ring.contains(self.start_pos) {
			return false;
		}
		let Some(highest_seen) = self.highest_seen else { return false };
		let mut candidate = None;
		for logical in self.start_pos + 1..=highest_seen {
			if let Some(c) = self.ring.get(logical) {
				if c.state == CellState::Good {
					candidate = Some((logical, c.timestamp));
					break;
				}
			}
		}
		let Some((logical, ts)) = candidate else { return false };
		if self.playout_time_us(ts) > now_us {
			return false;
		}
		let seq = self.base_seq.add_offset(logical as i64);
		self.drop_upto(seq);
		true
	}

	pub fn decrypt_failures(&self) -> u64 {
		self.decrypt_failures
	}

	/// Discards a cell whose payload failed decryption, counting it
	/// toward the decrypt-failure stat instead of delivering garbage. Marks
	/// the cell dropped rather than removing it, so ack/contiguity tracking
	/// proceeds past it the same way a dropped message does.
	pub fn discard_decrypt_failure(&mut self, logical: usize) {
		if let Some(c) = self.ring.get_mut(logical) {
			c.state = CellState::Dropped;
			c.payload.clear();
		}
		self.decrypt_failures += 1;
	}

	/// Records the arrival of a packet whose payload could not be
	/// decrypted: reserves its slot the same way `insert` would, then
	/// immediately discards it as a decrypt failure instead of delivering
	/// garbage to the application.
	pub fn insert_decrypt_failure(&mut self, seq: SeqNo, flags: MsgFlags, timestamp: u32) -> Result<()> {
		let offset = seq.diff_signed(self.base_seq.add_offset(self.start_pos as i64));
		if offset < 0 {
			return Err(TransportError::Duplicate);
		}
		let logical = self.start_pos + offset as usize;
		self.ensure_capacity(logical);
		if self.ring.contains(logical) {
			return Err(TransportError::Duplicate);
		}

		self.ring.insert(logical, Cell { state: CellState::Good, flags, timestamp, payload: Vec::new(), notch: 0 });
		self.highest_seen = Some(self.highest_seen.map_or(logical, |h| h.max(logical)));
		self.recount_max_pos();
		self.discard_decrypt_failure(logical);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msg::KeySlot;

	fn flags(boundary: BoundaryFlag, msgno: u32) -> MsgFlags {
		MsgFlags { boundary, order_required: true, key_slot: KeySlot::None, rexmit: false, msgno: MsgNo::new(msgno) }
	}

	#[test]
	fn stream_mode_reads_across_cells() {
		let mut buf = ReceiveBuffer::new(16, SeqNo::new(0), false, 0, 0);
		buf.insert(SeqNo::new(0), flags(BoundaryFlag::Solo, 1), 0, b"hel".to_vec()).unwrap();
		buf.insert(SeqNo::new(1), flags(BoundaryFlag::Solo, 2), 0, b"lo".to_vec()).unwrap();
		buf.ack(2);

		let mut dest = [0u8; 5];
		let n = buf.read_into(&mut dest);
		assert_eq!(n, 5);
		assert_eq!(&dest, b"hello");
	}

	#[test]
	fn message_mode_waits_for_full_message() {
		let mut buf = ReceiveBuffer::new(16, SeqNo::new(0), false, 0, 0);
		buf.insert(SeqNo::new(0), flags(BoundaryFlag::First, 1), 0, b"ab".to_vec()).unwrap();
		buf.ack(1);
		let mut dest = Vec::new();
		assert_eq!(buf.read_message(&mut dest, 0), 0);

		buf.insert(SeqNo::new(1), flags(BoundaryFlag::Last, 1), 0, b"cd".to_vec()).unwrap();
		buf.ack(1);
		let n = buf.read_message(&mut dest, 0);
		assert_eq!(n, 4);
		assert_eq!(dest, b"abcd");
	}

	#[test]
	fn tsbpd_mode_holds_message_until_playout_time() {
		let mut buf = ReceiveBuffer::new(16, SeqNo::new(0), true, 1000, 0);
		buf.insert(SeqNo::new(0), flags(BoundaryFlag::Solo, 1), 5000, b"x".to_vec()).unwrap();
		buf.ack(1);
		let mut dest = Vec::new();
		assert_eq!(buf.read_message(&mut dest, 100), 0);
		assert_eq!(buf.read_message(&mut dest, 6000), 1);
	}

	#[test]
	fn duplicate_insert_is_rejected() {
		let mut buf = ReceiveBuffer::new(16, SeqNo::new(0), false, 0, 0);
		buf.insert(SeqNo::new(0), flags(BoundaryFlag::Solo, 1), 0, b"x".to_vec()).unwrap();
		assert_eq!(buf.insert(SeqNo::new(0), flags(BoundaryFlag::Solo, 1), 0, b"y".to_vec()), Err(TransportError::Duplicate));
	}

	#[test]
	fn drop_message_marks_cells_dropped_and_skips_delivery() {
		let mut buf = ReceiveBuffer::new(16, SeqNo::new(0), false, 0, 0);
		buf.insert(SeqNo::new(0), flags(BoundaryFlag::First, 1), 0, b"ab".to_vec()).unwrap();
		buf.insert(SeqNo::new(1), flags(BoundaryFlag::Last, 1), 0, b"cd".to_vec()).unwrap();
		buf.ack(2);
		buf.drop_message(MsgNo::new(1));
		let mut dest = Vec::new();
		assert_eq!(buf.read_message(&mut dest, 0), 0);
		assert!(dest.is_empty());
	}
}
