//! The connection object: owns both buffers, both loss lists, a
//! congestion controller, and the per-connection state machine that ties
//! them together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use runtime::wait::Gate;
use runtime::Clock;

use crate::cc::Controller;
use crate::config::{Config, TransType};
use crate::crypto::PacketCrypto;
use crate::error::{Again, Result, TransportError};
use crate::handshake::HandshakeInfo;
use crate::loss::{RcvLossList, SndLossList};
use crate::msg::{KeySlot, MsgFlags, MsgNo};
use crate::packet::{ControlPacket, ControlType, DataPacket, Packet};
use crate::rcvbuf::ReceiveBuffer;
use crate::seq::SeqNo;
use crate::sndbuf::{ReadOutcome, SendBuffer};
use crate::stats::Stats;

const KEEPALIVE_INTERVAL_US: u64 = 1_000_000;
const NAK_REPORT_MAX_BACKOFF_US: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
	Init,
	Opened,
	Listening,
	Connecting,
	Connected,
	Broken,
	Closing,
	Closed,
	NonExistent,
}

struct Timers {
	last_ack_seq_sent: u32,
	next_ack_due_us: u64,
	next_keepalive_due_us: u64,
	last_data_recv_us: u64,
	rtt_us: u64,
	rtt_var_us: u64,
}

pub struct Connection {
	pub id: u32,
	peer_id: AtomicU32,
	peer_addr: Mutex<Option<SocketAddr>>,
	state: Mutex<State>,
	read_gate: Gate,
	write_gate: Gate,
	config: Config,
	clock: Clock,

	sndbuf: Mutex<SendBuffer>,
	rcvbuf: Mutex<ReceiveBuffer>,
	snd_loss: Mutex<SndLossList>,
	rcv_loss: Mutex<RcvLossList>,
	cc: Mutex<Controller>,
	stats: Mutex<Stats>,
	timers: Mutex<Timers>,

	crypto: Option<std::sync::Arc<dyn PacketCrypto>>,
	key_slot_parity: AtomicBool,
}

impl Connection {
	pub fn new(
		id: u32,
		config: Config,
		clock: Clock,
		start_seq: SeqNo,
		crypto: Option<std::sync::Arc<dyn PacketCrypto>>,
	) -> Self {
		let cc = match config.trans_type {
			TransType::Live => Controller::live(if config.max_bw > 0 { config.max_bw as f64 } else { 1_000_000.0 }),
			TransType::File => Controller::file(config.mss as f64, config.fc as f64),
		};

		Self {
			id,
			peer_id: AtomicU32::new(0),
			peer_addr: Mutex::new(None),
			state: Mutex::new(State::Init),
			read_gate: Gate::new(),
			write_gate: Gate::new(),
			sndbuf: Mutex::new(SendBuffer::new(config.sndbuf as usize, config.payload_size as usize, start_seq)),
			rcvbuf: Mutex::new(ReceiveBuffer::new(
				config.rcvbuf as usize,
				start_seq,
				config.tsbpd_mode,
				(config.rcv_latency_ms.max(config.tsbpd_delay_ms) as u64) * 1000,
				0,
			)),
			snd_loss: Mutex::new(SndLossList::new()),
			rcv_loss: Mutex::new(RcvLossList::new()),
			cc: Mutex::new(cc),
			stats: Mutex::new(Stats::default()),
			timers: Mutex::new(Timers {
				last_ack_seq_sent: 0,
				next_ack_due_us: 0,
				next_keepalive_due_us: 0,
				last_data_recv_us: 0,
				rtt_us: 100_000,
				rtt_var_us: 50_000,
			}),
			config,
			clock,
			crypto,
			key_slot_parity: AtomicBool::new(false),
		}
	}

	pub fn state(&self) -> State {
		*self.state.lock().unwrap()
	}

	pub fn set_state(&self, s: State) {
		*self.state.lock().unwrap() = s;
		self.read_gate.notify();
		self.write_gate.notify();
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		*self.peer_addr.lock().unwrap()
	}

	pub fn set_peer(&self, addr: SocketAddr, peer_id: u32) {
		*self.peer_addr.lock().unwrap() = Some(addr);
		self.peer_id.store(peer_id, Ordering::Release);
	}

	pub fn peer_id(&self) -> u32 {
		self.peer_id.load(Ordering::Acquire)
	}

	pub fn now_us(&self) -> u64 {
		self.clock.now_us()
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// `close` atomically flips the state and wakes every blocked reader
	/// and writer so they observe `Closing` and return `INTERRUPTED`
	/// on their next call.
	pub fn close(&self) {
		self.set_state(State::Closing);
	}

	fn next_key_slot(&self) -> KeySlot {
		if self.crypto.is_none() || self.config.passphrase.is_empty() {
			return KeySlot::None;
		}
		if self.key_slot_parity.fetch_xor(true, Ordering::Relaxed) { KeySlot::Odd } else { KeySlot::Even }
	}

	/// Queues application bytes, blocking (per `snd_syn`/`snd_timeout` if
	/// configured — here represented by the caller re-invoking after
	/// `write_gate` wakes) when the flow window is full.
	pub fn write(&self, bytes: &[u8], ttl_ms: i64, order_required: bool, src_time_us: Option<u64>) -> Result<(MsgNo, SeqNo)> {
		if self.state() != State::Connected {
			return Err(TransportError::Connection("not connected".to_string()));
		}
		let mut sndbuf = self.sndbuf.lock().unwrap();
		if sndbuf.unacked_count() >= self.config.fc {
			return Err(TransportError::Again(Again::SndAgain));
		}
		let now = self.clock.now_us();
		Ok(sndbuf.enqueue(bytes, ttl_ms, order_required, src_time_us, now))
	}

	/// Message-mode read.
	pub fn read_message(&self, dest: &mut Vec<u8>) -> Result<usize> {
		if matches!(self.state(), State::Broken) {
			return Err(TransportError::Connection("broken".to_string()));
		}
		let now = self.clock.now_us() as i64;
		let n = self.rcvbuf.lock().unwrap().read_message(dest, now);
		Ok(n)
	}

	/// Stream-mode read.
	pub fn read_into(&self, dest: &mut [u8]) -> Result<usize> {
		if matches!(self.state(), State::Broken) {
			return Err(TransportError::Connection("broken".to_string()));
		}
		Ok(self.rcvbuf.lock().unwrap().read_into(dest))
	}

	pub fn wait_readable(&self, timeout_ms: u32) -> bool {
		self.read_gate.wait_for(std::time::Duration::from_millis(timeout_ms as u64))
	}

	pub fn wait_writable(&self, timeout_ms: u32) -> bool {
		self.write_gate.wait_for(std::time::Duration::from_millis(timeout_ms as u64))
	}

	/// Packs the next outbound packet for the scheduler: retransmits take
	/// priority over fresh data. A message that expired by TTL before it could be sent
	/// yields a DROPREQ instead of a DATA packet.
	pub fn pack_next(&self) -> Option<(Packet, SocketAddr)> {
		let peer = self.peer_addr()?;
		let now = self.clock.now_us();

		let mut sndbuf = self.sndbuf.lock().unwrap();
		let mut snd_loss = self.snd_loss.lock().unwrap();
		let mut cc = self.cc.lock().unwrap();

		let (outcome, is_retransmit) = loop {
			match snd_loss.pop() {
				Some(seq) => match sndbuf.retransmit_offset(seq) {
					Some(offset) => break (sndbuf.read_retransmit(offset, now), true),
					// Already acked and reclaimed; try the next loss entry.
					None => continue,
				},
				None => break (sndbuf.read_next(now), false),
			}
		};

		match outcome {
			ReadOutcome::Packet(block) => {
				cc.on_send(block.payload.len());
				let mut stats = self.stats.lock().unwrap();
				stats.on_send();
				if is_retransmit {
					stats.on_retransmit();
				}
				drop(stats);
				let slot = self.next_key_slot();
				let payload = match (&self.crypto, slot) {
					(Some(c), slot) if slot != KeySlot::None => c.seal(slot, &block.payload),
					_ => block.payload,
				};
				let flags = MsgFlags {
					boundary: block.boundary,
					order_required: block.order_required,
					key_slot: slot,
					rexmit: is_retransmit,
					msgno: block.msgno,
				};
				Some((
					Packet::Data(DataPacket {
						seq: block.seq,
						flags,
						timestamp: now as u32,
						dest_id: self.peer_id(),
						payload,
					}),
					peer,
				))
			}
			ReadOutcome::Expired { msgno, .. } => Some((
				Packet::Control(ControlPacket {
					ctype: ControlType::DropReq,
					subheader: msgno.get(),
					timestamp: now as u32,
					dest_id: self.peer_id(),
					payload: Vec::new(),
				}),
				peer,
			)),
			ReadOutcome::Empty => None,
		}
	}

	pub fn next_send_time_us(&self) -> u64 {
		self.clock.now_us() + self.cc.lock().unwrap().pkt_send_period_us()
	}

	/// Ingests a DATA packet.
	pub fn process_data(&self, pkt: DataPacket) {
		let now = self.clock.now_us();
		self.timers.lock().unwrap().last_data_recv_us = now;

		let payload = match (&self.crypto, pkt.flags.key_slot) {
			(Some(_), KeySlot::None) => Ok(pkt.payload),
			(Some(c), slot) => c.open(slot, &pkt.payload),
			(None, _) => Ok(pkt.payload),
		};

		let payload = match payload {
			Ok(p) => p,
			Err(_) => {
				let mut rcvbuf = self.rcvbuf.lock().unwrap();
				self.rcv_loss.lock().unwrap().remove(pkt.seq);
				if rcvbuf.insert_decrypt_failure(pkt.seq, pkt.flags, pkt.timestamp).is_ok() {
					let n = rcvbuf.contiguous_ready();
					rcvbuf.ack(n);
				}
				drop(rcvbuf);
				self.stats.lock().unwrap().on_drop(1);
				self.read_gate.notify();
				return;
			}
		};

		let mut rcvbuf = self.rcvbuf.lock().unwrap();
		let mut rcv_loss = self.rcv_loss.lock().unwrap();
		rcv_loss.remove(pkt.seq);
		let prev_highest = rcvbuf.highest_seen_seq();
		match rcvbuf.insert(pkt.seq, pkt.flags, pkt.timestamp, payload) {
			Ok(()) => {
				if let Some(prev) = prev_highest {
					if pkt.seq.diff_signed(prev) > 1 {
						let rtt_us = self.timers.lock().unwrap().rtt_us;
						rcv_loss.insert(prev.increment(), pkt.seq.decrement(), now, rtt_us);
					}
				}
				let n = rcvbuf.contiguous_ready();
				rcvbuf.ack(n);
				self.stats.lock().unwrap().on_receive();
			}
			Err(TransportError::Duplicate) => {}
			Err(_) => {}
		}
		drop(rcvbuf);
		drop(rcv_loss);
		self.read_gate.notify();
	}

	/// Ingests a CONTROL packet.
	pub fn process_control(&self, pkt: ControlPacket) -> Vec<(Packet, SocketAddr)> {
		let now = self.clock.now_us();
		let peer = match self.peer_addr() {
			Some(p) => p,
			None => return Vec::new(),
		};
		let mut out = Vec::new();

		match pkt.ctype {
			ControlType::Ack => {
				let ack_seq = SeqNo::new(pkt.subheader);
				let newly_acked = self.sndbuf.lock().unwrap().ack_upto(ack_seq);
				self.cc.lock().unwrap().on_ack(newly_acked);
				self.write_gate.notify();
				out.push((
					Packet::Control(ControlPacket {
						ctype: ControlType::AckAck,
						subheader: pkt.subheader,
						timestamp: (now) as u32,
						dest_id: self.peer_id(),
						payload: Vec::new(),
					}),
					peer,
				));
			}
			ControlType::AckAck => {
				self.rcvbuf.lock().unwrap().on_ackack(pkt.timestamp, now as i64);
				let mut timers = self.timers.lock().unwrap();
				let sample = now.saturating_sub(timers.last_data_recv_us);
				timers.rtt_var_us = (timers.rtt_var_us * 3 + sample.abs_diff(timers.rtt_us)) / 4;
				timers.rtt_us = (timers.rtt_us * 7 + sample) / 8;
			}
			ControlType::LossReport => {
				let mut snd_loss = self.snd_loss.lock().unwrap();
				let mut i = 0;
				while i + 4 <= pkt.payload.len() {
					let entry = u32::from_be_bytes(pkt.payload[i..i + 4].try_into().unwrap());
					if entry & 0x8000_0000 != 0 {
						let first = SeqNo::new(entry & 0x7FFF_FFFF);
						i += 4;
						let last = SeqNo::new(u32::from_be_bytes(pkt.payload[i..i + 4].try_into().unwrap()));
						snd_loss.insert(first, last);
						self.cc.lock().unwrap().on_loss(first);
					} else {
						let seq = SeqNo::new(entry);
						snd_loss.insert(seq, seq);
						self.cc.lock().unwrap().on_loss(seq);
					}
					i += 4;
				}
				self.stats.lock().unwrap().on_nak_received();
			}
			ControlType::DropReq => {
				self.rcvbuf.lock().unwrap().drop_message(MsgNo::new(pkt.subheader));
			}
			ControlType::Handshake => {
				if let Ok(info) = HandshakeInfo::decode(&pkt.payload) {
					self.peer_id.store(info.socket_id, Ordering::Release);
					self.set_state(State::Connected);
				}
			}
			ControlType::Keepalive => {}
			ControlType::Shutdown => {
				self.set_state(State::Broken);
			}
			ControlType::PeerError => {
				self.set_state(State::Broken);
			}
			_ => {}
		}

		out
	}

	/// Services ACK/NAK/retransmission/keepalive timers; called once per
	/// receive-worker iteration by the dispatch list.
	pub fn check_timers(&self) -> Vec<(Packet, SocketAddr)> {
		let peer = match self.peer_addr() {
			Some(p) => p,
			None => return Vec::new(),
		};
		let now = self.clock.now_us();
		let mut out = Vec::new();

		if self.state() == State::Closing && self.sndbuf.lock().unwrap().unacked_count() == 0 {
			self.set_state(State::Closed);
			return out;
		}

		if self.config.snd_drop_delay_ms > 0 {
			let cutoff_us = now.saturating_sub((self.config.tsbpd_delay_ms as u64 + self.config.snd_drop_delay_ms as u64) * 1000);
			if self.sndbuf.lock().unwrap().drop_late(cutoff_us) > 0 {
				self.write_gate.notify();
			}
		}

		if self.rcvbuf.lock().unwrap().tsbpd_late_drop(now as i64) {
			self.read_gate.notify();
		}

		{
			let mut timers = self.timers.lock().unwrap();
			if now >= timers.next_keepalive_due_us {
				timers.next_keepalive_due_us = now + KEEPALIVE_INTERVAL_US;
				out.push((
					Packet::Control(ControlPacket {
						ctype: ControlType::Keepalive,
						subheader: 0,
						timestamp: now as u32,
						dest_id: self.peer_id(),
						payload: Vec::new(),
					}),
					peer,
				));
			}

			if self.config.conn_timeo_ms > 0
				&& now.saturating_sub(timers.last_data_recv_us) > self.config.conn_timeo_ms as u64 * 1000
				&& timers.last_data_recv_us > 0
			{
				drop(timers);
				self.set_state(State::Broken);
				return out;
			}

			let ack_period_us = self.cc.lock().unwrap().ack_period_us();
			if now >= timers.next_ack_due_us {
				timers.next_ack_due_us = now + ack_period_us;
				let ack_seq = self.rcvbuf.lock().unwrap().last_ack_seq();
				if ack_seq.get() != timers.last_ack_seq_sent {
					timers.last_ack_seq_sent = ack_seq.get();
					out.push((
						Packet::Control(ControlPacket {
							ctype: ControlType::Ack,
							subheader: ack_seq.get(),
							timestamp: now as u32,
							dest_id: self.peer_id(),
							payload: Vec::new(),
						}),
						peer,
					));
				}
			}
		}

		let nak_interval_us = self.cc.lock().unwrap().nak_interval_us();
		let due = self.rcv_loss.lock().unwrap().due(now, NAK_REPORT_MAX_BACKOFF_US.max(nak_interval_us));
		if !due.is_empty() {
			let mut payload = Vec::new();
			for r in due {
				if r.first == r.last {
					payload.extend_from_slice(&r.first.get().to_be_bytes());
				} else {
					payload.extend_from_slice(&(r.first.get() | 0x8000_0000).to_be_bytes());
					payload.extend_from_slice(&r.last.get().to_be_bytes());
				}
			}
			out.push((
				Packet::Control(ControlPacket {
					ctype: ControlType::LossReport,
					subheader: 0,
					timestamp: now as u32,
					dest_id: self.peer_id(),
					payload,
				}),
				peer,
			));
			self.stats.lock().unwrap().on_nak_sent();
		}

		out
	}

	pub fn stats(&self) -> Stats {
		let mut stats = *self.stats.lock().unwrap();
		let timers = self.timers.lock().unwrap();
		let cc = self.cc.lock().unwrap();
		stats.rtt_us = timers.rtt_us as u32;
		stats.rtt_var_us = timers.rtt_var_us as u32;
		stats.rto_us = Controller::rto_us(timers.rtt_us, timers.rtt_var_us);
		stats.snd_bandwidth_bps = cc.snd_bandwidth_bps();
		stats.ack_interval_packets = cc.ack_interval_packets();
		stats.available_buf_packets = self.rcvbuf.lock().unwrap().contiguous_ready();
		stats.input_rate_bps = self.sndbuf.lock().unwrap().current_input_rate();
		stats
	}
}
