use std::net::SocketAddr;

use snafu::Snafu;

pub mod inbound;

pub use inbound::UdpListener;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	BindSocket { socket_addr: SocketAddr, source: std::io::Error },
	Io { source: std::io::Error },
}
