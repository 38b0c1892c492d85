//! The multiplexer: one UDP socket shared by every connection bound to it,
//! with a dedicated send worker and receive worker thread.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use runtime::Clock;

use crate::config::Config;
use crate::conn::{Connection, State};
use crate::crypto::{KeyMaterial, PacketCrypto, XChaChaKeys};
use crate::dispatch::DispatchList;
use crate::error::{Again, Result, TransportError};
use crate::handshake::{AcceptQueue, HandshakeInfo, PendingTable};
use crate::packet::{ControlPacket, ControlType, Packet};
use crate::sched::Scheduler;
use crate::seq::SeqNo;
use crate::unit::{UnitPool, UNIT_SIZE};

/// Initial slot count for a fresh multiplexer's unit pool; grows by the
/// same amount once occupancy crosses 90%.
const UNIT_POOL_INITIAL: usize = 64;

/// At most this many packets are held for a destination id the multiplexer
/// has not registered yet.
const LATE_BUFFER_CAP: usize = 16;
/// Receive worker poll granularity: bounds how late `check_timers` and
/// `PendingTable::walk` run when no traffic is arriving.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct Mux {
	socket: UdpSocket,
	clock: Clock,
	accept_config: Config,

	connections: Mutex<HashMap<u32, Arc<Connection>>>,
	scheduler: Scheduler<u32>,
	dispatch: DispatchList<u32>,
	pending: PendingTable,
	accept_queue: AcceptQueue,
	units: UnitPool,

	/// Outstanding handshake payload, kept so `PendingTable::walk`'s resend
	/// callback has something to retransmit.
	resend_payloads: Mutex<HashMap<u32, Vec<u8>>>,
	/// Key-material negotiators in flight, consulted once the peer's half
	/// of the exchange arrives.
	pending_crypto: Mutex<HashMap<u32, Arc<XChaChaKeys>>>,
	/// Packets addressed to an id not yet registered.
	late_buffers: Mutex<HashMap<u32, VecDeque<Vec<u8>>>>,

	next_id: AtomicU32,
	listening: AtomicBool,
	closed: AtomicBool,

	send_thread: Mutex<Option<JoinHandle<()>>>,
	recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Mux {
	/// Binds one UDP socket and starts the send/receive worker threads.
	/// `accept_config` governs connections created through
	/// `accept`; `connect` takes its own config per call.
	pub fn bind(addr: SocketAddr, accept_config: Config) -> Result<Arc<Self>> {
		accept_config.validate()?;
		let socket = UdpSocket::bind(addr).map_err(|e| TransportError::SysRes(e.to_string()))?;
		socket.set_read_timeout(Some(POLL_INTERVAL)).map_err(|e| TransportError::SysRes(e.to_string()))?;

		let mux = Arc::new(Self {
			socket,
			clock: Clock::new(),
			accept_config,
			connections: Mutex::new(HashMap::new()),
			scheduler: Scheduler::new(),
			dispatch: DispatchList::new(),
			pending: PendingTable::new(),
			accept_queue: AcceptQueue::new(),
			units: UnitPool::new(UNIT_POOL_INITIAL, UNIT_POOL_INITIAL),
			resend_payloads: Mutex::new(HashMap::new()),
			pending_crypto: Mutex::new(HashMap::new()),
			late_buffers: Mutex::new(HashMap::new()),
			next_id: AtomicU32::new(rand::random::<u32>().max(1)),
			listening: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			send_thread: Mutex::new(None),
			recv_thread: Mutex::new(None),
		});

		let send_mux = mux.clone();
		let send_handle = std::thread::spawn(move || send_mux.run_send_worker());
		*mux.send_thread.lock().unwrap() = Some(send_handle);

		let recv_mux = mux.clone();
		let recv_handle = std::thread::spawn(move || recv_mux.run_recv_worker());
		*mux.recv_thread.lock().unwrap() = Some(recv_handle);

		Ok(mux)
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.socket.local_addr().map_err(|e| TransportError::SysRes(e.to_string()))
	}

	/// Marks this multiplexer ready to accept inbound handshakes.
	pub fn listen(&self) {
		self.listening.store(true, Ordering::Release);
	}

	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.scheduler.close();
		self.accept_queue.wake();
	}

	fn fresh_id(&self) -> u32 {
		loop {
			let id = self.next_id.fetch_add(1, Ordering::Relaxed);
			if id != 0 {
				return id;
			}
		}
	}

	fn make_crypto(config: &Config) -> Option<Arc<XChaChaKeys>> {
		if config.passphrase.is_empty() {
			None
		} else {
			Some(Arc::new(XChaChaKeys::new()))
		}
	}

	fn send_direct(&self, pkt: &Packet, addr: SocketAddr) {
		let mut buf = [0u8; UNIT_SIZE];
		if let Ok(n) = pkt.encode(&mut buf) {
			let _ = self.socket.send_to(&buf[..n], addr);
		}
	}

	/// Encodes a control packet to its full wire framing, for stashing in
	/// `resend_payloads` so a later resend doesn't need to rebuild the
	/// header.
	fn encode_for_resend(pkt: &Packet) -> Vec<u8> {
		let mut buf = [0u8; UNIT_SIZE];
		let n = pkt.encode(&mut buf).unwrap_or(0);
		buf[..n].to_vec()
	}

	fn start_seq_for_new_connection(&self) -> SeqNo {
		SeqNo::new(rand::random::<u32>())
	}

	/// Initiates an outbound connection, blocking until the handshake
	/// completes, fails, or `config.conn_timeo_ms` elapses.
	pub fn connect(self: &Arc<Self>, addr: SocketAddr, config: Config) -> Result<Arc<Connection>> {
		config.validate()?;
		let id = self.fresh_id();
		let crypto = Self::make_crypto(&config);
		let conn = Arc::new(Connection::new(
			id,
			config.clone(),
			Clock::new(),
			self.start_seq_for_new_connection(),
			crypto.clone().map(|c| c as Arc<dyn PacketCrypto>),
		));
		conn.set_peer(addr, 0);
		conn.set_state(State::Connecting);
		self.connections.lock().unwrap().insert(id, conn.clone());
		if let Some(c) = &crypto {
			self.pending_crypto.lock().unwrap().insert(id, c.clone());
		}

		let info = HandshakeInfo {
			version: config.min_version.max(1),
			socket_id: id,
			tsbpd_send: config.tsbpd_mode,
			tsbpd_recv: config.tsbpd_mode,
			rexmit_flag: true,
			crypt: crypto.is_some(),
			tsbpd_delay_ms: config.tsbpd_delay_ms,
			peer_tsbpd_delay_ms: config.peer_latency_ms,
			congestion: config.congestion.clone(),
			stream_id: config.stream_id.clone(),
			key_material: crypto.as_ref().map(|c| c.propose()).unwrap_or_default(),
		};
		let pkt = Packet::Control(ControlPacket {
			ctype: ControlType::Handshake,
			subheader: 0,
			timestamp: conn.now_us() as u32,
			dest_id: 0,
			payload: info.encode(),
		});
		self.send_direct(&pkt, addr);

		let now = self.clock.now_us();
		let timeo_ms = if config.conn_timeo_ms > 0 { config.conn_timeo_ms } else { 3000 };
		let deadline = now + timeo_ms as u64 * 1000;
		self.resend_payloads.lock().unwrap().insert(id, Self::encode_for_resend(&pkt));
		self.pending.insert(id, addr, now, deadline);

		let result = loop {
			match conn.state() {
				State::Connected => break Ok(conn.clone()),
				State::Broken => break Err(TransportError::Connection("handshake failed".to_string())),
				_ => {
					conn.wait_readable(100);
					if self.clock.now_us() > deadline {
						break Err(TransportError::Again(Again::XmTimeout));
					}
				}
			}
		};

		self.pending.remove(id);
		self.resend_payloads.lock().unwrap().remove(&id);
		self.pending_crypto.lock().unwrap().remove(&id);

		match &result {
			Ok(_) => {
				self.dispatch.insert(id);
				self.scheduler.update(id, self.clock.now_us(), true);
				self.drain_late_buffer(id);
			}
			Err(_) => {
				self.connections.lock().unwrap().remove(&id);
			}
		}
		result
	}

	/// Blocks until the next inbound connection is ready.
	pub fn accept(&self) -> Option<Arc<Connection>> {
		loop {
			let id = self.accept_queue.pop_blocking()?;
			if let Some(conn) = self.connections.lock().unwrap().get(&id).cloned() {
				return Some(conn);
			}
		}
	}

	fn drain_late_buffer(&self, id: u32) {
		let buffered = self.late_buffers.lock().unwrap().remove(&id);
		let Some(buffered) = buffered else { return };
		for raw in buffered {
			if let Ok(pkt) = Packet::decode(&raw) {
				self.dispatch_known(id, pkt);
			}
		}
	}

	fn buffer_late(&self, id: u32, raw: Vec<u8>) {
		let mut buffers = self.late_buffers.lock().unwrap();
		let q = buffers.entry(id).or_default();
		if q.len() >= LATE_BUFFER_CAP {
			q.pop_front();
		}
		q.push_back(raw);
	}

	/// Feeds an already-classified packet to `id`'s connection ingress and
	/// flushes whatever control replies it produced.
	fn dispatch_known(&self, id: u32, pkt: Packet) {
		let conn = { self.connections.lock().unwrap().get(&id).cloned() };
		let Some(conn) = conn else { return };

		match pkt {
			Packet::Data(d) => conn.process_data(d),
			Packet::Control(c) => {
				if c.ctype == ControlType::Handshake {
					if let Ok(info) = HandshakeInfo::decode(&c.payload) {
						if let Some(crypto) = self.pending_crypto.lock().unwrap().remove(&id) {
							if !info.key_material.is_empty() {
								let _ = crypto.accept(&info.key_material);
							}
						}
					}
				}
				let out = conn.process_control(c);
				for (reply, addr) in out {
					self.send_direct(&reply, addr);
				}
			}
		}

		self.dispatch.insert(id);
		self.scheduler.update(id, self.clock.now_us(), true);
	}

	/// Handles an id-0 packet: a fresh inbound handshake, routed to the
	/// listener if one is registered.
	fn handle_handshake_request(&self, pkt: Packet, addr: SocketAddr) {
		if !self.listening.load(Ordering::Acquire) {
			return;
		}
		let Packet::Control(c) = pkt else { return };
		if c.ctype != ControlType::Handshake {
			return;
		}
		let Ok(info) = HandshakeInfo::decode(&c.payload) else { return };

		let id = self.fresh_id();
		let crypto = Self::make_crypto(&self.accept_config);
		if let (Some(c), false) = (&crypto, info.key_material.is_empty()) {
			let _ = c.accept(&info.key_material);
		}

		let conn = Arc::new(Connection::new(
			id,
			self.accept_config.clone(),
			Clock::new(),
			self.start_seq_for_new_connection(),
			crypto.clone().map(|c| c as Arc<dyn PacketCrypto>),
		));
		conn.set_peer(addr, info.socket_id);
		conn.set_state(State::Connected);
		self.connections.lock().unwrap().insert(id, conn.clone());
		self.dispatch.insert(id);
		self.scheduler.update(id, self.clock.now_us(), true);

		let reply = HandshakeInfo {
			version: self.accept_config.min_version.max(1),
			socket_id: id,
			tsbpd_send: self.accept_config.tsbpd_mode,
			tsbpd_recv: self.accept_config.tsbpd_mode,
			rexmit_flag: true,
			crypt: crypto.is_some(),
			tsbpd_delay_ms: self.accept_config.tsbpd_delay_ms,
			peer_tsbpd_delay_ms: info.tsbpd_delay_ms,
			congestion: self.accept_config.congestion.clone(),
			stream_id: self.accept_config.stream_id.clone(),
			key_material: crypto.as_ref().map(|c| c.propose()).unwrap_or_default(),
		};
		let reply_pkt = Packet::Control(ControlPacket {
			ctype: ControlType::Handshake,
			subheader: 0,
			timestamp: conn.now_us() as u32,
			dest_id: info.socket_id,
			payload: reply.encode(),
		});
		self.send_direct(&reply_pkt, addr);

		self.accept_queue.push(id);
		self.drain_late_buffer(id);
	}

	/// Classifies one inbound datagram by destination socket id. The invariant that a packet only reaches a connection when
	/// both id and peer address match is enforced here, nowhere else.
	fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
		let pkt = match Packet::decode(data) {
			Ok(p) => p,
			Err(_) => return,
		};
		let dest_id = match &pkt {
			Packet::Data(d) => d.dest_id,
			Packet::Control(c) => c.dest_id,
		};

		if dest_id == 0 {
			self.handle_handshake_request(pkt, addr);
			return;
		}

		let known_addr = { self.connections.lock().unwrap().get(&dest_id).map(|c| c.peer_addr()) };
		match known_addr {
			Some(peer_addr) => {
				if peer_addr == Some(addr) {
					self.dispatch_known(dest_id, pkt);
				}
				// else: peer address mismatch — silently drop, possible forgery.
			}
			None => {
				if let Some(pending_id) = self.pending.find_by_addr(&addr) {
					self.dispatch_known(pending_id, pkt);
				} else {
					self.buffer_late(dest_id, data.to_vec());
				}
			}
		}
	}

	fn run_send_worker(self: Arc<Self>) {
		loop {
			let Some(id) = self.scheduler.pop_blocking(&self.clock) else {
				return;
			};

			let conn = { self.connections.lock().unwrap().get(&id).cloned() };
			let Some(conn) = conn else { continue };

			if let Some((pkt, addr)) = conn.pack_next() {
				self.send_direct(&pkt, addr);
			}

			if !matches!(conn.state(), State::Broken | State::Closed) {
				self.scheduler.update(id, conn.next_send_time_us(), false);
			} else {
				self.scheduler.remove(id);
			}
		}
	}

	fn run_recv_worker(self: Arc<Self>) {
		loop {
			if self.closed.load(Ordering::Acquire) {
				return;
			}

			if let Some(idx) = self.units.acquire() {
				if let Ok((_, addr)) = self.units.recv_into(idx, &self.socket) {
					let datagram = self.units.read(idx);
					self.units.release(idx);
					self.handle_datagram(&datagram, addr);
				} else {
					self.units.release(idx);
				}
			}

			let now = self.clock.now_us();
			let ids: Vec<u32> = {
				let mut v = Vec::new();
				self.dispatch.for_each(|id| v.push(id));
				v
			};
			for id in ids {
				let conn = { self.connections.lock().unwrap().get(&id).cloned() };
				let Some(conn) = conn else {
					self.dispatch.remove(id);
					continue;
				};
				for (pkt, addr) in conn.check_timers() {
					self.send_direct(&pkt, addr);
				}
				if matches!(conn.state(), State::Broken | State::Closed) {
					self.dispatch.remove(id);
					self.scheduler.remove(id);
					self.connections.lock().unwrap().remove(&id);
				}
			}

			let mut resends = Vec::new();
			self.pending.walk(
				now,
				|id, addr| {
					if let Some(payload) = self.resend_payloads.lock().unwrap().get(&id).cloned() {
						resends.push((payload, addr));
					}
				},
				|id| {
					if let Some(conn) = self.connections.lock().unwrap().remove(&id) {
						conn.set_state(State::Broken);
					}
					self.resend_payloads.lock().unwrap().remove(&id);
					self.pending_crypto.lock().unwrap().remove(&id);
				},
			);
			for (payload, addr) in resends {
				let _ = self.socket.send_to(&payload, addr);
			}
		}
	}
}

impl Drop for Mux {
	fn drop(&mut self) {
		self.close();
	}
}
