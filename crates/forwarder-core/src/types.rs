use std::{fmt, net::Ipv4Addr};

use bytes::Bytes;

/// Sentinel marking "no upstream response arrived within the deadline".
///
/// Used interchangeably as a response timestamp and as an EDR duration.
pub const TIMESTAMP_TIMEOUT: u64 = u64::MAX;

/// Status word prefixed to a reply payload that carries a genuine upstream response.
pub const STATUS_OK: u32 = 0;
/// Status word prefixed to a reply payload synthesized after a request-response timeout.
pub const STATUS_TIMEOUT: u32 = 1;

/// A datagram received on a UDP listener, immutable once constructed.
#[derive(Debug, Clone)]
pub struct ClientRequest {
	/// Identifies the originating UDP listener, for routing the eventual reply.
	pub listener_id: u32,
	pub arrival_time_ms: u64,
	pub client_addr: Ipv4Addr,
	pub client_port: u16,
	pub payload: Bytes,
}

/// A reply produced by a TCP upstream client: a genuine response, or a
/// synthetic one marking a per-request timeout.
#[derive(Debug, Clone)]
pub struct ServerResponse {
	pub request_id: u64,
	/// Wall-clock microseconds at egress from the upstream, or [`TIMESTAMP_TIMEOUT`].
	pub resp_timestamp_us: u64,
	/// Upstream reply body prefixed with a 4-byte status word.
	pub payload: Bytes,
}

impl ServerResponse {
	pub fn is_timeout(&self) -> bool {
		self.resp_timestamp_us == TIMESTAMP_TIMEOUT
	}

	/// Builds the synthetic response emitted when a per-request deadline fires
	/// with no matching receive.
	pub fn timed_out(request_id: u64) -> Self {
		Self {
			request_id,
			resp_timestamp_us: TIMESTAMP_TIMEOUT,
			payload: Bytes::copy_from_slice(&STATUS_TIMEOUT.to_ne_bytes()),
		}
	}
}

/// The forwarder's correlation entry for one outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
	pub request_id: u64,
	pub listener_id: u32,
	pub client_addr: Ipv4Addr,
	pub client_port: u16,
	pub server_addr: Ipv4Addr,
	pub server_port: u16,
	pub arrival_time_ms: u64,
	/// Wall-clock microseconds captured immediately before send.
	pub fwd_time_us: u64,
}

/// One completed or timed-out forwarding transaction, ready for the EDR sink.
#[derive(Debug, Clone)]
pub struct Edr {
	pub arrival_time_ms: u64,
	pub tcp_resp_dur_us: u64,
	pub client_addr: Ipv4Addr,
	pub client_port: u16,
	pub server_addr: Ipv4Addr,
	pub server_port: u16,
}

impl Edr {
	pub fn is_timeout(&self) -> bool {
		self.tcp_resp_dur_us == TIMESTAMP_TIMEOUT
	}
}

impl fmt::Display for Edr {
	/// `<arrival_time_ms> <client_ip>:<client_port> <server_ip>:<server_port> <dur>`
	/// where `<dur>` is `timed_out` or `<ms>.<frac3>_ms`.
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {}:{} {}:{} ",
			self.arrival_time_ms, self.client_addr, self.client_port, self.server_addr, self.server_port
		)?;
		if self.is_timeout() {
			write!(f, "timed_out")
		} else {
			write!(f, "{}.{:03}_ms", self.tcp_resp_dur_us / 1000, self.tcp_resp_dur_us % 1000)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn edr_formats_measured_duration_with_three_fractional_digits() {
		let edr = Edr {
			arrival_time_ms: 1_000,
			tcp_resp_dur_us: 1_234,
			client_addr: Ipv4Addr::new(127, 0, 0, 1),
			client_port: 55000,
			server_addr: Ipv4Addr::new(10, 0, 0, 1),
			server_port: 9000,
		};
		assert_eq!(edr.to_string(), "1000 127.0.0.1:55000 10.0.0.1:9000 1.234_ms");
	}

	#[test]
	fn edr_formats_timeout_literal() {
		let edr = Edr {
			arrival_time_ms: 1_000,
			tcp_resp_dur_us: TIMESTAMP_TIMEOUT,
			client_addr: Ipv4Addr::new(127, 0, 0, 1),
			client_port: 55000,
			server_addr: Ipv4Addr::new(10, 0, 0, 1),
			server_port: 9000,
		};
		assert_eq!(edr.to_string(), "1000 127.0.0.1:55000 10.0.0.1:9000 timed_out");
	}

	#[test]
	fn edr_pads_sub_millisecond_remainder() {
		let edr = Edr {
			arrival_time_ms: 0,
			tcp_resp_dur_us: 7,
			client_addr: Ipv4Addr::UNSPECIFIED,
			client_port: 0,
			server_addr: Ipv4Addr::UNSPECIFIED,
			server_port: 0,
		};
		assert_eq!(edr.to_string(), "0 0.0.0.0:0 0.0.0.0:0 0.007_ms");
	}
}
