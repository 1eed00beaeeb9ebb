use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use forwarder_core::{ClientRequest, Event, clock::now_us};
use snafu::ResultExt;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{BindSocketSnafu, Error};

const RECV_BUF_SIZE: usize = 4096;

/// One UDP ingress endpoint. Binds `0.0.0.0:<port>`, stays permanently armed
/// to receive, and hands each datagram to `incoming_req` subscribers.
pub struct UdpListener {
	listener_id: u32,
	socket: Arc<UdpSocket>,
	cancel: CancellationToken,
	pub incoming_req: Event<ClientRequest>,
}

impl UdpListener {
	pub async fn bind(listener_id: u32, port: u16) -> Result<Self, Error> {
		let addr = SocketAddr::from(([0, 0, 0, 0], port));
		let socket = UdpSocket::bind(addr).await.context(BindSocketSnafu { socket_addr: addr })?;
		Ok(Self {
			listener_id,
			socket: Arc::new(socket),
			cancel: CancellationToken::new(),
			incoming_req: Event::new(),
		})
	}

	pub fn listener_id(&self) -> u32 {
		self.listener_id
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// Sends a reply datagram. Failures are logged and dropped; UDP offers
	/// no delivery guarantee to begin with.
	pub async fn send(&self, peer: SocketAddr, bytes: &[u8]) {
		if let Err(source) = self.socket.send_to(bytes, peer).await {
			forwarder_core::warn!("listener {} failed to send reply to {peer}: {source}", self.listener_id);
		}
	}

	/// Runs the receive loop until `stop` is called. Each datagram is
	/// timestamped and published on `incoming_req`; the loop then re-arms
	/// immediately.
	pub async fn run(&self) {
		let mut buf = [0u8; RECV_BUF_SIZE];
		loop {
			tokio::select! {
				res = self.socket.recv_from(&mut buf) => {
					match res {
						Ok((len, SocketAddr::V4(peer))) => {
							let req = ClientRequest {
								listener_id: self.listener_id,
								arrival_time_ms: now_us() / 1000,
								client_addr: *peer.ip(),
								client_port: peer.port(),
								payload: Bytes::copy_from_slice(&buf[..len]),
							};
							self.incoming_req.invoke(&req);
						}
						Ok((_, SocketAddr::V6(peer))) => {
							forwarder_core::warn!("listener {} ignoring IPv6 peer {peer}", self.listener_id);
						}
						Err(source) => {
							forwarder_core::warn!("listener {} receive error: {source}", self.listener_id);
						}
					}
				}
				_ = self.cancel.cancelled() => {
					forwarder_core::info!("listener {} stopping", self.listener_id);
					return;
				}
			}
		}
	}

	pub fn stop(&self) {
		self.cancel.cancel();
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::net::UdpSocket as StdUdp;

	use super::*;

	#[tokio::test]
	async fn receives_and_publishes_a_datagram() {
		let listener = Arc::new(UdpListener::bind(1, 0).await.unwrap());
		let bound_addr = listener.socket.local_addr().unwrap();

		let seen = Arc::new(tokio::sync::Mutex::new(None));
		let seen_clone = seen.clone();
		listener.incoming_req.subscribe(move |req: &ClientRequest| {
			let seen_clone = seen_clone.clone();
			let req = req.clone();
			tokio::spawn(async move {
				*seen_clone.lock().await = Some(req);
			});
		});

		let listener_run = listener.clone();
		let handle = tokio::spawn(async move { listener_run.run().await });

		let client = StdUdp::bind("127.0.0.1:0").await.unwrap();
		client.send_to(b"ping", bound_addr).await.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;
		listener.stop();
		handle.await.unwrap();

		let req = seen.lock().await.take().expect("datagram should have been published");
		assert_eq!(&req.payload[..], b"ping");
		assert_eq!(req.listener_id, 1);
	}

	#[tokio::test]
	async fn stop_ends_the_run_loop_without_a_datagram() {
		let listener = Arc::new(UdpListener::bind(2, 0).await.unwrap());
		let listener_run = listener.clone();
		let handle = tokio::spawn(async move { listener_run.run().await });

		tokio::time::sleep(Duration::from_millis(10)).await;
		listener.stop();

		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("run() should return promptly after stop()")
			.unwrap();
	}
}
