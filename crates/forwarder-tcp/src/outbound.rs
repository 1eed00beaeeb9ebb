use std::{
	collections::HashMap,
	net::SocketAddr,
	sync::{Arc, Mutex as StdMutex},
	time::Duration,
};

use bytes::Bytes;
use forwarder_core::{STATUS_OK, ServerResponse, clock::now_us, event::Event};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpStream, tcp::OwnedWriteHalf},
	sync::Mutex as AsyncMutex,
};
use tokio_util::sync::CancellationToken;

const RECV_BUF_SIZE: usize = 4096;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
	Disconnected,
	Connecting,
	Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	Accepted,
	Rejected,
}

struct PendingEntry {
	cancel: CancellationToken,
}

/// A persistent TCP connection to one upstream `(ipv4, port)`, reconnecting
/// on its own whenever the socket drops or a connect attempt stalls.
///
/// Construct with [`TcpUpstreamClient::new`], spawn [`TcpUpstreamClient::run`]
/// as a background task, then drive it with [`TcpUpstreamClient::send`] and
/// subscribe to [`TcpUpstreamClient::response_ready`].
pub struct TcpUpstreamClient {
	pub addr: SocketAddr,
	connection_timeout: Duration,
	response_timeout: Duration,
	state: StdMutex<ConnState>,
	write_half: AsyncMutex<Option<OwnedWriteHalf>>,
	pending: StdMutex<HashMap<u64, PendingEntry>>,
	stop_token: CancellationToken,
	pub response_ready: Event<ServerResponse>,
}

impl TcpUpstreamClient {
	pub fn new(addr: SocketAddr, connection_timeout: Duration, response_timeout: Duration) -> Arc<Self> {
		Arc::new(Self {
			addr,
			connection_timeout,
			response_timeout,
			state: StdMutex::new(ConnState::Disconnected),
			write_half: AsyncMutex::new(None),
			pending: StdMutex::new(HashMap::new()),
			stop_token: CancellationToken::new(),
			response_ready: Event::new(),
		})
	}

	pub fn is_connected(&self) -> bool {
		*self.state.lock().unwrap() == ConnState::Connected
	}

	/// Drives connect, reconnect, and receive for the client's whole
	/// lifetime. Returns once [`TcpUpstreamClient::stop`] has been called.
	pub async fn run(self: &Arc<Self>) {
		loop {
			if self.stop_token.is_cancelled() {
				return;
			}

			*self.state.lock().unwrap() = ConnState::Connecting;
			tokio::select! {
				biased;

				_ = self.stop_token.cancelled() => return,

				conn = TcpStream::connect(self.addr) => {
					match conn {
						Ok(stream) => self.serve_connection(stream).await,
						Err(source) => {
							forwarder_core::warn!("connect to {} failed: {source}", self.addr);
						}
					}
				}

				_ = tokio::time::sleep(self.connection_timeout) => {
					forwarder_core::warn!("connect to {} timed out after {:?}", self.addr, self.connection_timeout);
				}
			}

			*self.state.lock().unwrap() = ConnState::Disconnected;
			if self.stop_token.is_cancelled() {
				return;
			}
			tokio::time::sleep(RECONNECT_BACKOFF).await;
		}
	}

	async fn serve_connection(self: &Arc<Self>, stream: TcpStream) {
		forwarder_core::info!("connected to upstream {}", self.addr);
		let (mut read_half, write_half) = stream.into_split();
		*self.write_half.lock().await = Some(write_half);
		*self.state.lock().unwrap() = ConnState::Connected;

		let mut buf = [0u8; RECV_BUF_SIZE];
		loop {
			tokio::select! {
				biased;

				_ = self.stop_token.cancelled() => break,

				res = read_half.read(&mut buf) => match res {
					Ok(0) => {
						forwarder_core::warn!("upstream {} closed the connection", self.addr);
						break;
					}
					Ok(len) if len < 8 => {
						forwarder_core::warn!("upstream {} sent a {len}-byte response, too short to carry a request id", self.addr);
					}
					Ok(len) => self.handle_response(&buf[..len]),
					Err(source) => {
						forwarder_core::warn!("receive error from {}: {source}", self.addr);
						break;
					}
				},
			}
		}

		*self.write_half.lock().await = None;
	}

	fn handle_response(self: &Arc<Self>, buf: &[u8]) {
		let request_id = u64::from_ne_bytes(buf[..8].try_into().expect("checked length >= 8"));
		let body = &buf[8..];

		let entry = self.pending.lock().unwrap().remove(&request_id);
		let Some(entry) = entry else {
			forwarder_core::warn!("response for unknown or already-settled request {request_id} from {}", self.addr);
			return;
		};
		entry.cancel.cancel();

		let mut payload = Vec::with_capacity(4 + body.len());
		payload.extend_from_slice(&STATUS_OK.to_ne_bytes());
		payload.extend_from_slice(body);

		self.response_ready.invoke(&ServerResponse {
			request_id,
			resp_timestamp_us: now_us(),
			payload: Bytes::from(payload),
		});
	}

	/// Hands `payload` to the upstream under `request_id`. Rejected when
	/// disconnected, `payload` is empty, or `request_id` is already pending
	/// on this client.
	pub async fn send(self: &Arc<Self>, request_id: u64, payload: Bytes) -> SendOutcome {
		if !self.is_connected() || payload.is_empty() {
			return SendOutcome::Rejected;
		}

		let cancel = CancellationToken::new();
		{
			let mut pending = self.pending.lock().unwrap();
			if pending.contains_key(&request_id) {
				return SendOutcome::Rejected;
			}
			pending.insert(request_id, PendingEntry { cancel: cancel.clone() });
		}
		self.arm_request_timeout(request_id, cancel);

		let mut guard = self.write_half.lock().await;
		if let Some(write_half) = guard.as_mut() {
			if let Err(source) = write_half.write_all(&payload).await {
				forwarder_core::warn!("send to {} failed: {source}", self.addr);
				drop(guard);
				self.drop_connection().await;
			}
		}

		SendOutcome::Accepted
	}

	fn arm_request_timeout(self: &Arc<Self>, request_id: u64, cancel: CancellationToken) {
		let this = self.clone();
		let deadline = self.response_timeout;
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(deadline) => this.settle_timeout(request_id),
				_ = cancel.cancelled() => {}
			}
		});
	}

	fn settle_timeout(self: &Arc<Self>, request_id: u64) {
		if self.pending.lock().unwrap().remove(&request_id).is_some() {
			self.response_ready.invoke(&ServerResponse::timed_out(request_id));
		}
	}

	/// Forces a reconnect after a send error. Pending requests are left
	/// alone; they still settle on their own deadlines, since the upstream
	/// may answer racily even after the socket it answered on is gone.
	async fn drop_connection(&self) {
		*self.write_half.lock().await = None;
		*self.state.lock().unwrap() = ConnState::Disconnected;
	}

	/// Stops the client: cancels every pending request timer, drops the
	/// socket, and prevents further reconnects. No further events are
	/// emitted afterward.
	pub fn stop(&self) {
		self.stop_token.cancel();
		for (_, entry) in self.pending.lock().unwrap().drain() {
			entry.cancel.cancel();
		}
		*self.state.lock().unwrap() = ConnState::Disconnected;
	}
}

#[cfg(test)]
mod tests {
	use tokio::net::TcpListener;

	use super::*;

	async fn spawn_echo_server() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
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

	async fn spawn_silent_server() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			loop {
				let Ok((sock, _)) = listener.accept().await else { return };
				// Accept and hold the connection open, but never respond.
				std::mem::forget(sock);
			}
		});
		addr
	}

	#[tokio::test]
	async fn send_then_receive_settles_pending_entry() {
		let addr = spawn_echo_server().await;
		let client = TcpUpstreamClient::new(addr, Duration::from_millis(500), Duration::from_millis(500));
		let client_run = client.clone();
		tokio::spawn(async move { client_run.run().await });

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(client.is_connected());

		let seen = Arc::new(StdMutex::new(None));
		let seen_clone = seen.clone();
		client.response_ready.subscribe(move |resp: &ServerResponse| {
			*seen_clone.lock().unwrap() = Some(resp.clone());
		});

		let mut msg = 7u64.to_ne_bytes().to_vec();
		msg.extend_from_slice(b"hello");
		let outcome = client.send(7, Bytes::from(msg)).await;
		assert_eq!(outcome, SendOutcome::Accepted);

		tokio::time::sleep(Duration::from_millis(100)).await;
		let resp = seen.lock().unwrap().take().expect("response should have arrived");
		assert_eq!(resp.request_id, 7);
		assert!(!resp.is_timeout());
		assert_eq!(&resp.payload[4..], b"hello");

		client.stop();
	}

	#[tokio::test]
	async fn unanswered_request_times_out() {
		let addr = spawn_silent_server().await;
		let client = TcpUpstreamClient::new(addr, Duration::from_millis(500), Duration::from_millis(100));
		let client_run = client.clone();
		tokio::spawn(async move { client_run.run().await });

		tokio::time::sleep(Duration::from_millis(50)).await;

		let seen = Arc::new(StdMutex::new(None));
		let seen_clone = seen.clone();
		client.response_ready.subscribe(move |resp: &ServerResponse| {
			*seen_clone.lock().unwrap() = Some(resp.clone());
		});

		let outcome = client.send(9, Bytes::from_static(b"x")).await;
		assert_eq!(outcome, SendOutcome::Accepted);

		tokio::time::sleep(Duration::from_millis(250)).await;
		let resp = seen.lock().unwrap().take().expect("a timeout response should have fired");
		assert_eq!(resp.request_id, 9);
		assert!(resp.is_timeout());

		client.stop();
	}

	#[tokio::test]
	async fn send_rejects_empty_payload_and_duplicate_ids() {
		let addr = spawn_echo_server().await;
		let client = TcpUpstreamClient::new(addr, Duration::from_millis(500), Duration::from_millis(500));
		let client_run = client.clone();
		tokio::spawn(async move { client_run.run().await });
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert_eq!(client.send(1, Bytes::new()).await, SendOutcome::Rejected);

		let mut msg = 2u64.to_ne_bytes().to_vec();
		msg.extend_from_slice(b"a");
		assert_eq!(client.send(2, Bytes::from(msg.clone())).await, SendOutcome::Accepted);
		assert_eq!(client.send(2, Bytes::from(msg)).await, SendOutcome::Rejected);

		client.stop();
	}

	#[tokio::test]
	async fn send_before_connect_is_rejected() {
		let addr = spawn_echo_server().await;
		let client = TcpUpstreamClient::new(addr, Duration::from_millis(500), Duration::from_millis(500));
		assert_eq!(client.send(1, Bytes::from_static(b"x")).await, SendOutcome::Rejected);
	}
}
