//! Connection options, validated at
//! `bind`/`connect` time so a bad combination surfaces as a `SETUP` error
//! before any packet goes on the wire.

use crate::error::{Result, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransType {
	Live,
	File,
}

/// Options fixed once a connection leaves `init`/`opened`.
#[derive(Clone, Debug)]
pub struct Config {
	pub mss: u32,
	pub sndbuf: u32,
	pub rcvbuf: u32,
	pub fc: u32,
	pub ip_ttl: u8,
	pub ip_tos: u8,
	pub trans_type: TransType,
	pub tsbpd_mode: bool,
	pub tsbpd_delay_ms: u32,
	pub passphrase: Vec<u8>,
	pub pbkeylen: u8,
	pub congestion: String,
	pub payload_size: u32,
	pub stream_id: String,
	pub message_api: bool,
	pub min_version: u32,
	pub nak_report: bool,
	pub conn_timeo_ms: u32,
	pub loss_max_ttl: u32,
	pub rcv_latency_ms: u32,
	pub peer_latency_ms: u32,

	// Post-connect, mutable for the connection's lifetime.
	pub input_bw: i64,
	pub oheadbw_pct: u32,
	pub max_bw: i64,
	pub snd_drop_delay_ms: i32,
	pub km_refresh_rate: u32,
	pub km_preannounce: u32,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			mss: 1500,
			sndbuf: 8192,
			rcvbuf: 8192,
			fc: 25600,
			ip_ttl: 64,
			ip_tos: 0,
			trans_type: TransType::Live,
			tsbpd_mode: true,
			tsbpd_delay_ms: 120,
			passphrase: Vec::new(),
			pbkeylen: 0,
			congestion: "live".to_string(),
			payload_size: 1316,
			stream_id: String::new(),
			message_api: true,
			min_version: 0,
			nak_report: true,
			conn_timeo_ms: 3000,
			loss_max_ttl: 0,
			rcv_latency_ms: 120,
			peer_latency_ms: 0,
			input_bw: 0,
			oheadbw_pct: 25,
			max_bw: -1,
			snd_drop_delay_ms: 0,
			km_refresh_rate: 0,
			km_preannounce: 0,
		}
	}
}

pub struct ConfigBuilder {
	cfg: Config,
}

impl Config {
	pub fn builder() -> ConfigBuilder {
		ConfigBuilder { cfg: Config::default() }
	}

	/// Validates the option combination: `MSS >= 576`,
	/// `PBKEYLEN in {0,16,24,32}`, `PAYLOADSIZE <= 1456` for live mode, and
	/// `STREAMID` at most 512 bytes.
	pub fn validate(&self) -> Result<()> {
		if self.mss < 576 {
			return Err(TransportError::Setup("MSS below 576".to_string()));
		}
		if !matches!(self.pbkeylen, 0 | 16 | 24 | 32) {
			return Err(TransportError::Setup("PBKEYLEN must be 0, 16, 24 or 32".to_string()));
		}
		if self.trans_type == TransType::Live && self.payload_size > 1456 {
			return Err(TransportError::Setup("PAYLOADSIZE exceeds 1456 in live mode".to_string()));
		}
		if self.stream_id.len() > 512 {
			return Err(TransportError::Setup("STREAMID exceeds 512 bytes".to_string()));
		}
		Ok(())
	}
}

macro_rules! setter {
	($name:ident: $ty:ty) => {
		pub fn $name(mut self, v: $ty) -> Self {
			self.cfg.$name = v;
			self
		}
	};
}

impl ConfigBuilder {
	setter!(mss: u32);
	setter!(sndbuf: u32);
	setter!(rcvbuf: u32);
	setter!(fc: u32);
	setter!(ip_ttl: u8);
	setter!(ip_tos: u8);
	setter!(trans_type: TransType);
	setter!(tsbpd_mode: bool);
	setter!(tsbpd_delay_ms: u32);
	setter!(pbkeylen: u8);
	setter!(payload_size: u32);
	setter!(message_api: bool);
	setter!(min_version: u32);
	setter!(nak_report: bool);
	setter!(conn_timeo_ms: u32);
	setter!(loss_max_ttl: u32);
	setter!(rcv_latency_ms: u32);
	setter!(peer_latency_ms: u32);
	setter!(input_bw: i64);
	setter!(oheadbw_pct: u32);
	setter!(max_bw: i64);
	setter!(snd_drop_delay_ms: i32);
	setter!(km_refresh_rate: u32);
	setter!(km_preannounce: u32);

	pub fn passphrase(mut self, v: impl Into<Vec<u8>>) -> Self {
		self.cfg.passphrase = v.into();
		self
	}

	pub fn congestion(mut self, v: impl Into<String>) -> Self {
		self.cfg.congestion = v.into();
		self
	}

	pub fn stream_id(mut self, v: impl Into<String>) -> Self {
		self.cfg.stream_id = v.into();
		self
	}

	pub fn build(self) -> Result<Config> {
		self.cfg.validate()?;
		Ok(self.cfg)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_small_mss() {
		assert!(Config::builder().mss(100).build().is_err());
	}

	#[test]
	fn rejects_oversized_live_payload() {
		let err = Config::builder().trans_type(TransType::Live).payload_size(2000).build();
		assert!(err.is_err());
	}

	#[test]
	fn file_mode_allows_large_payload() {
		assert!(Config::builder().trans_type(TransType::File).payload_size(2000).build().is_ok());
	}
}
