//! A reliable, paced, timestamp-playout transport over UDP: the packet
//! codec, buffers, loss lists, congestion control, scheduler, multiplexer
//! and handshake dispatch that make up one connection's lifetime, plus the
//! `Socket`/`Listener` facade applications actually call.

pub mod cc;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod loss;
pub mod msg;
pub mod mux;
pub mod packet;
pub mod rcvbuf;
pub mod sched;
pub mod seq;
pub mod sndbuf;
pub mod stats;
pub mod unit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use config::{Config, ConfigBuilder, TransType};
pub use conn::{Connection, State};
pub use error::{Again, Result, TransportError};
pub use msg::MsgNo;
pub use mux::Mux;
pub use seq::SeqNo;
pub use stats::Stats;

/// A connected (or accepted) endpoint. Owns the multiplexer it shares with
/// every other socket bound to the same local address, plus its own
/// connection object.
pub struct Socket {
	mux: Arc<Mux>,
	conn: Arc<Connection>,
}

impl Socket {
	/// Binds an ephemeral local endpoint and connects to `addr`.
	pub fn connect(addr: SocketAddr, config: Config) -> Result<Self> {
		let local: SocketAddr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().unwrap();
		let mux = Mux::bind(local, Config::default())?;
		let conn = mux.connect(addr, config)?;
		Ok(Self { mux, conn })
	}

	/// Writes one application message, blocking while the flow window is
	/// full until `timeout` elapses.
	pub fn write(&self, bytes: &[u8], ttl_ms: i64, order_required: bool, timeout: Option<Duration>) -> Result<(MsgNo, SeqNo)> {
		let deadline = timeout.map(|d| std::time::Instant::now() + d);
		loop {
			match self.conn.write(bytes, ttl_ms, order_required, None) {
				Ok(r) => return Ok(r),
				Err(TransportError::Again(Again::SndAgain)) => {
					let remaining = match deadline {
						Some(d) => match d.checked_duration_since(std::time::Instant::now()) {
							Some(r) => r,
							None => return Err(TransportError::Again(Again::SndAgain)),
						},
						None => Duration::from_millis(100),
					};
					self.conn.wait_writable(remaining.as_millis().min(u32::MAX as u128) as u32);
					if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
						return Err(TransportError::Again(Again::SndAgain));
					}
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Reads one complete, in-order message. Blocks until one is deliverable or `timeout`
	/// elapses.
	pub fn read(&self, dest: &mut Vec<u8>, timeout: Option<Duration>) -> Result<usize> {
		let deadline = timeout.map(|d| std::time::Instant::now() + d);
		loop {
			let n = self.conn.read_message(dest)?;
			if n > 0 {
				return Ok(n);
			}
			let remaining = match deadline {
				Some(d) => match d.checked_duration_since(std::time::Instant::now()) {
					Some(r) => r,
					None => return Err(TransportError::Again(Again::RcvAgain)),
				},
				None => Duration::from_millis(100),
			};
			self.conn.wait_readable(remaining.as_millis().min(u32::MAX as u128) as u32);
			if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
				return Err(TransportError::Again(Again::RcvAgain));
			}
		}
	}

	/// Stream-mode read: copies whatever bytes are immediately available,
	/// up to `dest.len()`, without waiting for a full message boundary.
	pub fn read_stream(&self, dest: &mut [u8]) -> Result<usize> {
		self.conn.read_into(dest)
	}

	pub fn stats(&self) -> Stats {
		self.conn.stats()
	}

	pub fn state(&self) -> State {
		self.conn.state()
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.mux.local_addr()
	}

	/// Flips the connection to `closing`; in-flight reads/writes observe
	/// `INTERRUPTED`.
	pub fn close(&self) {
		self.conn.close();
	}
}

/// A bound, listening endpoint that hands off newly accepted connections
/// through `accept`.
pub struct Listener {
	mux: Arc<Mux>,
}

impl Listener {
	pub fn bind(addr: SocketAddr, accept_config: Config) -> Result<Self> {
		let mux = Mux::bind(addr, accept_config)?;
		mux.listen();
		Ok(Self { mux })
	}

	/// Blocks until a newly accepted connection is ready.
	pub fn accept(&self) -> Result<Socket> {
		let conn = self.mux.accept().ok_or_else(|| TransportError::Connection("listener closed".to_string()))?;
		Ok(Socket { mux: self.mux.clone(), conn })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.mux.local_addr()
	}

	pub fn close(&self) {
		self.mux.close();
	}
}
