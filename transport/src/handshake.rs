//! Handshake dispatch: the pending-connector table and the listener's
//! accept-ready queue used to resolve an inbound packet's owner before a
//! connection object exists.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;

use collections::bytes::{Reader, Writer};
use runtime::wait::Gate;

use crate::error::{Result, TransportError};

const RESEND_INTERVAL_US: u64 = 250_000;

/// The extension payload carried by a HANDSHAKE control packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInfo {
	pub version: u32,
	pub socket_id: u32,
	pub tsbpd_send: bool,
	pub tsbpd_recv: bool,
	pub rexmit_flag: bool,
	pub crypt: bool,
	pub tsbpd_delay_ms: u32,
	pub peer_tsbpd_delay_ms: u32,
	pub congestion: String,
	pub stream_id: String,
	pub key_material: Vec<u8>,
}

fn put_string(w: &mut Writer, s: &str) {
	w.put_u16(s.len() as u16);
	w.put_bytes(s.as_bytes());
}

fn get_string(r: &mut Reader) -> Result<String> {
	let len = r.get_u16().map_err(|_| TransportError::Malformed)? as usize;
	let bytes = r.get_bytes(len).map_err(|_| TransportError::Malformed)?;
	String::from_utf8(bytes.to_vec()).map_err(|_| TransportError::Malformed)
}

impl HandshakeInfo {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![0u8; 4096];
		let mut w = Writer::new(&mut buf);
		w.put_u32(self.version);
		w.put_u32(self.socket_id);
		let flags = (self.tsbpd_send as u8)
			| ((self.tsbpd_recv as u8) << 1)
			| ((self.rexmit_flag as u8) << 2)
			| ((self.crypt as u8) << 3);
		w.put_u8(flags);
		w.put_u32(self.tsbpd_delay_ms);
		w.put_u32(self.peer_tsbpd_delay_ms);
		put_string(&mut w, &self.congestion);
		put_string(&mut w, &self.stream_id);
		w.put_u16(self.key_material.len() as u16);
		w.put_bytes(&self.key_material);
		let pos = w.position();
		buf.truncate(pos);
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut r = Reader::new(buf);
		let version = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let socket_id = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let flags = r.get_u8().map_err(|_| TransportError::Malformed)?;
		let tsbpd_delay_ms = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let peer_tsbpd_delay_ms = r.get_u32().map_err(|_| TransportError::Malformed)?;
		let congestion = get_string(&mut r)?;
		let stream_id = get_string(&mut r)?;
		let km_len = r.get_u16().map_err(|_| TransportError::Malformed)? as usize;
		let key_material = r.get_bytes(km_len).map_err(|_| TransportError::Malformed)?.to_vec();
		Ok(Self {
			version,
			socket_id,
			tsbpd_send: flags & 0b0001 != 0,
			tsbpd_recv: flags & 0b0010 != 0,
			rexmit_flag: flags & 0b0100 != 0,
			crypt: flags & 0b1000 != 0,
			tsbpd_delay_ms,
			peer_tsbpd_delay_ms,
			congestion,
			stream_id,
			key_material,
		})
	}
}

pub struct PendingConnector {
	pub peer_addr: SocketAddr,
	pub deadline_us: u64,
	last_resend_us: u64,
	pub resends: u32,
}

/// One multiplexer-wide table, walked periodically by the receive worker
/// to resend unanswered handshakes and expire ones that never got a reply.
pub struct PendingTable {
	entries: Mutex<HashMap<u32, PendingConnector>>,
}

impl PendingTable {
	pub fn new() -> Self {
		Self { entries: Mutex::new(HashMap::new()) }
	}

	pub fn insert(&self, id: u32, peer_addr: SocketAddr, now_us: u64, deadline_us: u64) {
		self.entries.lock().unwrap().insert(id, PendingConnector { peer_addr, deadline_us, last_resend_us: now_us, resends: 0 });
	}

	pub fn remove(&self, id: u32) -> Option<PendingConnector> {
		self.entries.lock().unwrap().remove(&id)
	}

	pub fn contains(&self, id: u32) -> bool {
		self.entries.lock().unwrap().contains_key(&id)
	}

	/// Finds a pending connector awaiting a reply from `addr`, the lookup
	/// path used by the multiplexer for unmatched inbound handshake
	/// traffic.
	pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<u32> {
		self.entries.lock().unwrap().iter().find(|(_, pc)| &pc.peer_addr == addr).map(|(id, _)| *id)
	}

	/// Resends at most once per `RESEND_INTERVAL_US` per entry and expires
	/// (removing) entries past their deadline.
	pub fn walk(&self, now_us: u64, mut on_resend: impl FnMut(u32, SocketAddr), mut on_expired: impl FnMut(u32)) {
		let mut entries = self.entries.lock().unwrap();
		let mut expired = Vec::new();

		for (id, pc) in entries.iter_mut() {
			if now_us > pc.deadline_us {
				expired.push(*id);
				continue;
			}
			if now_us.saturating_sub(pc.last_resend_us) >= RESEND_INTERVAL_US {
				pc.last_resend_us = now_us;
				pc.resends += 1;
				on_resend(*id, pc.peer_addr);
			}
		}

		for id in expired {
			entries.remove(&id);
			on_expired(id);
		}
	}
}

impl Default for PendingTable {
	fn default() -> Self {
		Self::new()
	}
}

/// The listener's queue of newly accepted connections, handed to the
/// application through `accept`.
pub struct AcceptQueue {
	ids: Mutex<VecDeque<u32>>,
	gate: Gate,
}

impl AcceptQueue {
	pub fn new() -> Self {
		Self { ids: Mutex::new(VecDeque::new()), gate: Gate::new() }
	}

	pub fn push(&self, id: u32) {
		self.ids.lock().unwrap().push_back(id);
		self.gate.notify();
	}

	pub fn try_pop(&self) -> Option<u32> {
		self.ids.lock().unwrap().pop_front()
	}

	/// Blocks until a connection is ready, or returns `None` if woken
	/// without one (e.g. the listener was closed).
	pub fn pop_blocking(&self) -> Option<u32> {
		loop {
			if let Some(id) = self.try_pop() {
				return Some(id);
			}
			self.gate.wait();
			if self.ids.lock().unwrap().is_empty() {
				return None;
			}
		}
	}

	pub fn wake(&self) {
		self.gate.notify();
	}
}

impl Default for AcceptQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(port: u16) -> SocketAddr {
		format!("127.0.0.1:{port}").parse().unwrap()
	}

	#[test]
	fn walk_resends_then_expires() {
		let table = PendingTable::new();
		table.insert(1, addr(9000), 0, 1_000_000);

		let mut resends = 0;
		table.walk(0, |_, _| resends += 1, |_| panic!("should not expire yet"));
		assert_eq!(resends, 1);

		table.walk(100_000, |_, _| resends += 1, |_| panic!("still not due"));
		assert_eq!(resends, 1);

		table.walk(300_000, |_, _| resends += 1, |_| panic!("still before deadline"));
		assert_eq!(resends, 2);

		let mut expired = false;
		table.walk(2_000_000, |_, _| panic!("must not resend past deadline"), |_| expired = true);
		assert!(expired);
		assert!(!table.contains(1));
	}

	#[test]
	fn find_by_addr_matches_pending_entry() {
		let table = PendingTable::new();
		table.insert(7, addr(5000), 0, 100);
		assert_eq!(table.find_by_addr(&addr(5000)), Some(7));
		assert_eq!(table.find_by_addr(&addr(5001)), None);
	}

	#[test]
	fn handshake_info_roundtrip() {
		let info = HandshakeInfo {
			version: 1,
			socket_id: 0xABCD,
			tsbpd_send: true,
			tsbpd_recv: false,
			rexmit_flag: true,
			crypt: false,
			tsbpd_delay_ms: 120,
			peer_tsbpd_delay_ms: 200,
			congestion: "live".to_string(),
			stream_id: "demo".to_string(),
			key_material: vec![1, 2, 3, 4],
		};
		let encoded = info.encode();
		assert_eq!(HandshakeInfo::decode(&encoded).unwrap(), info);
	}

	#[test]
	fn accept_queue_fifo() {
		let q = AcceptQueue::new();
		q.push(1);
		q.push(2);
		assert_eq!(q.try_pop(), Some(1));
		assert_eq!(q.try_pop(), Some(2));
		assert_eq!(q.try_pop(), None);
	}
}
