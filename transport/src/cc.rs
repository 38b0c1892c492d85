//! Congestion controller: a tagged variant
//! of `{Live, File}` rather than an open trait hierarchy, per the explicit
//! "do not design for open extension within the core" guidance.

use crate::seq::SeqNo;

const NAK_INTERVAL_FLOOR_US: u64 = 20_000;
const CONTROL_INTERVAL_US: u64 = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct LiveState {
	pub max_bw_bps: f64,
	pub avg_payload_bytes: f64,
	pub header_size_bytes: f64,
	pub measured_nak_interval_us: u64,
}

impl LiveState {
	fn new(max_bw_bps: f64) -> Self {
		Self { max_bw_bps, avg_payload_bytes: 0.0, header_size_bytes: 16.0, measured_nak_interval_us: 40_000 }
	}

	fn send_period_us(&self) -> u64 {
		if self.max_bw_bps <= 0.0 {
			return 0;
		}
		(((self.avg_payload_bytes + self.header_size_bytes) / self.max_bw_bps) * 1_000_000.0) as u64
	}

	fn on_send(&mut self, payload_len: usize) {
		// IIR filter, coefficient 1/128.
		self.avg_payload_bytes += (payload_len as f64 - self.avg_payload_bytes) / 128.0;
	}

	fn nak_interval_us(&self) -> u64 {
		(self.measured_nak_interval_us / 2).max(NAK_INTERVAL_FLOOR_US)
	}
}

#[derive(Clone, Copy, Debug)]
pub struct FileState {
	pub mss_bytes: f64,
	pub cg_window_packets: f64,
	pub max_window_packets: f64,
	pub rx_rate_pps: Option<f64>,
	pub rtt_us: u64,
	pub period_us: f64,
	pub slow_start: bool,
	pub last_decrease_seq: Option<SeqNo>,
	pub bandwidth_estimate_pps: f64,
	pub current_rate_pps: f64,
	pub max_bw_bps: f64,
}

impl FileState {
	fn new(mss_bytes: f64, max_window_packets: f64) -> Self {
		Self {
			mss_bytes,
			cg_window_packets: 16.0,
			max_window_packets,
			rx_rate_pps: None,
			rtt_us: 100_000,
			period_us: 1000.0,
			slow_start: true,
			last_decrease_seq: None,
			bandwidth_estimate_pps: 0.0,
			current_rate_pps: 0.0,
			max_bw_bps: -1.0,
		}
	}

	/// Called once per newly-acknowledged packet count during slow start.
	fn on_ack_slow_start(&mut self, newly_acked: u32) {
		if !self.slow_start {
			return;
		}
		self.cg_window_packets += newly_acked as f64;
		if self.cg_window_packets >= self.max_window_packets {
			self.cg_window_packets = self.max_window_packets;
			self.slow_start = false;
			self.period_us = match self.rx_rate_pps {
				Some(rate) if rate > 0.0 => 1_000_000.0 / rate,
				_ => {
					(self.cg_window_packets / ((self.rtt_us as f64 + CONTROL_INTERVAL_US as f64) / 1_000_000.0))
						.recip() * 1_000_000.0
				}
			};
		}
	}

	/// Congestion-avoidance rate increase, run once per control
	/// interval (~10ms).
	fn on_control_interval(&mut self) {
		if self.slow_start {
			return;
		}
		let b = (self.bandwidth_estimate_pps - self.current_rate_pps).max(0.0);
		if b <= 0.0 {
			return;
		}
		let exponent = (b * self.mss_bytes * 8.0).log10().ceil();
		let inc = 10f64.powf(exponent) * 1.5e-6 / self.mss_bytes;
		let rate_pps = if self.period_us > 0.0 { 1_000_000.0 / self.period_us } else { 0.0 };
		let new_rate = rate_pps + inc;
		if new_rate > 0.0 {
			self.period_us = 1_000_000.0 / new_rate;
		}
	}

	/// Multiplicative decrease on a fresh loss event.
	fn on_loss(&mut self, first_lost: SeqNo) -> bool {
		let is_new = match self.last_decrease_seq {
			Some(prev) => first_lost.later_than(prev),
			None => true,
		};
		if is_new {
			self.period_us *= 1.125;
			self.last_decrease_seq = Some(first_lost);
		}
		is_new
	}
}

#[derive(Clone, Copy, Debug)]
pub enum Controller {
	Live(LiveState),
	File(FileState),
}

impl Controller {
	pub fn live(max_bw_bps: f64) -> Self {
		Controller::Live(LiveState::new(max_bw_bps))
	}

	pub fn file(mss_bytes: f64, max_window_packets: f64) -> Self {
		Controller::File(FileState::new(mss_bytes, max_window_packets))
	}

	pub fn pkt_send_period_us(&self) -> u64 {
		match self {
			Controller::Live(s) => s.send_period_us(),
			Controller::File(s) => s.period_us.max(0.0) as u64,
		}
	}

	pub fn cg_window_packets(&self) -> f64 {
		match self {
			Controller::Live(_) => f64::MAX,
			Controller::File(s) => s.cg_window_packets,
		}
	}

	pub fn max_window(&self) -> f64 {
		match self {
			Controller::Live(_) => f64::MAX,
			Controller::File(s) => s.max_window_packets,
		}
	}

	pub fn nak_interval_us(&self) -> u64 {
		match self {
			Controller::Live(s) => s.nak_interval_us(),
			Controller::File(_) => NAK_INTERVAL_FLOOR_US,
		}
	}

	/// Estimated send bandwidth in bits per second: the configured cap in
	/// live mode, or the current pacing period's implied throughput in
	/// file mode.
	pub fn snd_bandwidth_bps(&self) -> f64 {
		match self {
			Controller::Live(s) => s.max_bw_bps,
			Controller::File(s) => {
				if s.period_us > 0.0 {
					(1_000_000.0 / s.period_us) * s.mss_bytes * 8.0
				} else {
					0.0
				}
			}
		}
	}

	/// How many packets this mode expects between ACKs.
	pub fn ack_interval_packets(&self) -> u32 {
		match self {
			Controller::Live(_) => 1,
			Controller::File(s) => (s.cg_window_packets / 4.0).max(1.0) as u32,
		}
	}

	/// Minimum spacing between ACKs, in microseconds: the same control
	/// interval both modes use for their periodic window/rate updates.
	pub fn ack_period_us(&self) -> u64 {
		CONTROL_INTERVAL_US
	}

	/// Retransmission timeout from an RTT estimate: RTT plus four times
	/// its variance. A pure function of the caller's RTT tracking since
	/// the controller itself does not sample round trips.
	pub fn rto_us(rtt_us: u64, rtt_var_us: u64) -> u64 {
		rtt_us + 4 * rtt_var_us
	}

	pub fn on_send(&mut self, payload_len: usize) {
		if let Controller::Live(s) = self {
			s.on_send(payload_len);
		}
	}

	pub fn on_ack(&mut self, newly_acked: u32) {
		if let Controller::File(s) = self {
			s.on_ack_slow_start(newly_acked);
		}
	}

	pub fn on_loss(&mut self, first_lost: SeqNo) {
		if let Controller::File(s) = self {
			s.on_loss(first_lost);
		}
	}

	pub fn on_timer_control_interval(&mut self) {
		if let Controller::File(s) = self {
			s.on_control_interval();
		}
	}

	pub fn on_bw_change(&mut self, max_bw_bps: f64, measured_pps: Option<f64>) {
		match self {
			Controller::Live(s) => s.max_bw_bps = max_bw_bps,
			Controller::File(s) => {
				s.max_bw_bps = max_bw_bps;
				if let Some(pps) = measured_pps {
					s.rx_rate_pps = Some(pps);
					s.bandwidth_estimate_pps = pps;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn live_send_period_uses_avg_payload() {
		let mut c = Controller::live(1_000_000.0);
		c.on_send(1000);
		assert!(c.pkt_send_period_us() > 0);
	}

	#[test]
	fn file_slow_start_ends_at_ceiling() {
		let mut c = Controller::file(1500.0, 20.0);
		c.on_ack(25);
		assert_eq!(c.cg_window_packets(), 20.0);
	}

	#[test]
	fn file_loss_only_decreases_once_per_epoch() {
		let mut c = Controller::File(FileState::new(1500.0, 20.0));
		if let Controller::File(s) = &mut c {
			s.slow_start = false;
			s.period_us = 1000.0;
		}
		c.on_loss(SeqNo::new(100));
		let after_first = c.pkt_send_period_us();
		c.on_loss(SeqNo::new(50)); // earlier than last decrease, ignored
		assert_eq!(c.pkt_send_period_us(), after_first);
		c.on_loss(SeqNo::new(200)); // later, applies again
		assert!(c.pkt_send_period_us() > after_first);
	}
}
