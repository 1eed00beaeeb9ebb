//! Fake TCP upstream servers for exercising [`forwarder_tcp::TcpUpstreamClient`]
//! and the round-robin forwarder without a real backend. Same shapes as the
//! per-crate test helpers they were promoted from, kept here so
//! `forwarder-engine` and the `forwarder` binary's integration tests can
//! share them.

use std::net::SocketAddr;

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};

const RECV_BUF_SIZE: usize = 4096;

/// Echoes every received buffer back verbatim, on every accepted connection.
/// Suitable for request/response round-trip tests where the caller already
/// embeds its own correlation id in the bytes it sends.
pub async fn spawn_echo_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo upstream");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else { return };
			tokio::spawn(async move {
				let mut buf = [0u8; RECV_BUF_SIZE];
				loop {
					match sock.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(len) => {
							if sock.write_all(&buf[..len]).await.is_err() {
								return;
							}
						}
					}
				}
			});
		}
	});
	addr
}

/// Accepts connections and holds them open, but never writes a reply.
/// Drives a client's request-timeout path without ever closing the socket.
pub async fn spawn_silent_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind silent upstream");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		loop {
			let Ok((sock, _)) = listener.accept().await else { return };
			std::mem::forget(sock);
		}
	});
	addr
}

/// Accepts a connection, reads one buffer, and closes without replying.
/// Drives a client's reconnect path after a mid-flight drop.
pub async fn spawn_disconnect_after_recv_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind disconnecting upstream");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else { return };
			let mut buf = [0u8; RECV_BUF_SIZE];
			let _ = sock.read(&mut buf).await;
			drop(sock);
		}
	});
	addr
}

/// Binds a socket and immediately closes it, yielding an address real
/// connection attempts to will be refused against. Drives a client's
/// never-connects path.
pub async fn unreachable_addr() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind throwaway listener");
	listener.local_addr().expect("local addr")
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::net::TcpStream;

	use super::*;

	#[tokio::test]
	async fn echo_upstream_returns_what_it_is_sent() {
		let addr = spawn_echo_upstream().await;
		let mut sock = TcpStream::connect(addr).await.unwrap();
		sock.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		sock.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
	}

	#[tokio::test]
	async fn silent_upstream_never_replies() {
		let addr = spawn_silent_upstream().await;
		let mut sock = TcpStream::connect(addr).await.unwrap();
		sock.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 1];
		let result = tokio::time::timeout(Duration::from_millis(100), sock.read(&mut buf)).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn unreachable_addr_refuses_connections() {
		let addr = unreachable_addr().await;
		assert!(TcpStream::connect(addr).await.is_err());
	}
}
