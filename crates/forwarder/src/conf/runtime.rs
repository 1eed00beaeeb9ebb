use std::{net::SocketAddr, path::PathBuf, time::Duration};

use snafu::{Snafu, ensure};

use super::persistent::PersistentConfig;

#[derive(Debug, Snafu)]
pub enum Error {
	#[snafu(display("config must declare at least one entry in udp_ports"))]
	EmptyUdpPorts,
	#[snafu(display("config must declare at least one entry in tcp_clients"))]
	EmptyTcpClients,
}

/// The validated, ready-to-run configuration: ports that become
/// [`forwarder_udp::UdpListener`]s, upstream addresses that become
/// [`forwarder_tcp::TcpUpstreamClient`]s, and the two timeouts and optional
/// EDR path the rest of the system is built from.
pub struct RuntimeConfig {
	pub udp_ports: Vec<u16>,
	pub tcp_clients: Vec<SocketAddr>,
	pub response_timeout: Duration,
	pub connection_timeout: Duration,
	pub edr_log: Option<PathBuf>,
}

impl RuntimeConfig {
	pub fn from_persistent(config: PersistentConfig) -> Result<Self, Error> {
		ensure!(!config.udp_ports.is_empty(), EmptyUdpPortsSnafu);
		ensure!(!config.tcp_clients.is_empty(), EmptyTcpClientsSnafu);

		Ok(Self {
			udp_ports: config.udp_ports,
			tcp_clients: config.tcp_clients.into_iter().map(|c| SocketAddr::from((c.ipv4, c.port))).collect(),
			response_timeout: Duration::from_millis(u64::from(config.response_timeout_ms)),
			connection_timeout: Duration::from_millis(u64::from(config.connection_timeout_ms)),
			edr_log: config.edr_log.map(PathBuf::from),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::conf::persistent::TcpClientConfig;

	#[test]
	fn rejects_empty_udp_ports() {
		let config = PersistentConfig { udp_ports: vec![], tcp_clients: vec![TcpClientConfig::default()], ..Default::default() };
		assert!(matches!(RuntimeConfig::from_persistent(config), Err(Error::EmptyUdpPorts)));
	}

	#[test]
	fn rejects_empty_tcp_clients() {
		let config = PersistentConfig { udp_ports: vec![9000], tcp_clients: vec![], ..Default::default() };
		assert!(matches!(RuntimeConfig::from_persistent(config), Err(Error::EmptyTcpClients)));
	}

	#[test]
	fn converts_millisecond_fields_to_durations() {
		let config = PersistentConfig {
			udp_ports: vec![9000],
			tcp_clients: vec![TcpClientConfig::default()],
			response_timeout_ms: 1500,
			connection_timeout_ms: 3000,
			edr_log: None,
		};
		let runtime = RuntimeConfig::from_persistent(config).unwrap();
		assert_eq!(runtime.response_timeout, Duration::from_millis(1500));
		assert_eq!(runtime.connection_timeout, Duration::from_millis(3000));
	}
}
