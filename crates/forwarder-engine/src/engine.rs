//! The round-robin forwarder (C3): the concurrency-safe request/response
//! coordinator. Owns the upstream client list, the round-robin cursor, the
//! request/response FIFOs, and the pending-request table; demultiplexes
//! upstream responses back to the originating UDP listener and emits one EDR
//! per completed or timed-out transaction.

use std::{
	collections::{HashMap, VecDeque},
	net::SocketAddr,
	sync::{Arc, Mutex},
};

use bytes::Bytes;
use forwarder_core::{
	ClientRequest, Edr, Event, PendingRequest, RequestIdGenerator, ServerResponse, SubscriptionToken, TIMESTAMP_TIMEOUT,
	clock::now_us,
};
use forwarder_tcp::{SendOutcome, TcpUpstreamClient};
use forwarder_udp::UdpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scans forward from `(cursor + 1) % len`, wrapping once, for the first
/// `true` entry in `statuses`. If the scan returns all the way to `cursor`
/// without finding one, `statuses[cursor]` itself is checked last. Pure and
/// free-standing so the cursor arithmetic is testable without real sockets.
fn next_connected_index(statuses: &[bool], cursor: usize) -> Option<usize> {
	let len = statuses.len();
	if len == 0 {
		return None;
	}
	for step in 1..=len {
		let idx = (cursor + step) % len;
		if statuses[idx] {
			return Some(idx);
		}
	}
	None
}

/// The forwarder's correlation table, its inbound/outbound FIFOs, and the
/// round-robin upstream list, wired together behind the single `schedule`
/// capability described in the design notes. Alternative scheduling policies
/// (random, least-loaded) are future realizations of the same shape; this
/// one is round-robin.
pub struct RoundRobinForwarder {
	clients: Vec<Arc<TcpUpstreamClient>>,
	listeners: HashMap<u32, Arc<UdpListener>>,
	cursor: Mutex<usize>,
	request_fifo: Mutex<VecDeque<ClientRequest>>,
	response_fifo: Mutex<VecDeque<ServerResponse>>,
	pending: Mutex<HashMap<u64, PendingRequest>>,
	id_gen: Mutex<RequestIdGenerator>,
	stop_flag: CancellationToken,
	worker: Mutex<Option<JoinHandle<()>>>,
	response_tokens: Mutex<Vec<SubscriptionToken>>,
	/// Fires once per completed or timed-out transaction; subscribe an EDR
	/// sink to it.
	pub edr_report: Event<Edr>,
}

impl RoundRobinForwarder {
	/// Builds the forwarder over `clients` (round-robin order) and
	/// `listeners` (keyed by the `listener_id` replies are addressed to),
	/// subscribes to every client's `response_ready`, and immediately spawns
	/// the worker task that drains the FIFOs until [`RoundRobinForwarder::stop`].
	///
	/// # Panics
	/// Panics if `clients` is empty — the only condition under which this
	/// system is allowed to crash the process (mirrors the source contract's
	/// uncaught constructor exception on an empty upstream list).
	pub fn new(clients: Vec<Arc<TcpUpstreamClient>>, listeners: HashMap<u32, Arc<UdpListener>>) -> Arc<Self> {
		assert!(!clients.is_empty(), "round-robin forwarder requires at least one upstream client");

		let this = Arc::new(Self {
			clients,
			listeners,
			cursor: Mutex::new(0),
			request_fifo: Mutex::new(VecDeque::new()),
			response_fifo: Mutex::new(VecDeque::new()),
			pending: Mutex::new(HashMap::new()),
			id_gen: Mutex::new(RequestIdGenerator::new()),
			stop_flag: CancellationToken::new(),
			worker: Mutex::new(None),
			response_tokens: Mutex::new(Vec::new()),
			edr_report: Event::new(),
		});

		let mut tokens = Vec::with_capacity(this.clients.len());
		for client in &this.clients {
			let token = client.response_ready.subscribe_weak(&this, |forwarder, resp: &ServerResponse| {
				forwarder.response_fifo.lock().unwrap().push_back(resp.clone());
			});
			tokens.push(token);
		}
		*this.response_tokens.lock().unwrap() = tokens;

		let worker = {
			let this = this.clone();
			tokio::spawn(async move { this.main_loop().await })
		};
		*this.worker.lock().unwrap() = Some(worker);

		this
	}

	/// The single scheduling capability: enqueue a `ClientRequest` for the
	/// next pass of the worker loop. Synchronous and lock-only, so it can be
	/// wired directly as a listener's `incoming_req` subscriber.
	pub fn schedule(&self, req: ClientRequest) {
		self.request_fifo.lock().unwrap().push_back(req);
	}

	async fn main_loop(self: Arc<Self>) {
		loop {
			if self.stop_flag.is_cancelled() {
				break;
			}
			self.forward_requests().await;
			self.send_responses().await;
			tokio::task::yield_now().await;
		}
	}

	/// `get_next_client`: advances the round-robin cursor to the next
	/// connected client, wrapping once, falling back to the current cursor
	/// if it is still connected. Returns `None` if no client is connected.
	fn get_next_client(&self) -> Option<Arc<TcpUpstreamClient>> {
		let mut cursor = self.cursor.lock().unwrap();
		let statuses: Vec<bool> = self.clients.iter().map(|c| c.is_connected()).collect();
		let idx = next_connected_index(&statuses, *cursor)?;
		*cursor = idx;
		Some(self.clients[idx].clone())
	}

	/// Drains the request FIFO as long as a connected client is available.
	/// The moment no client is reachable, any requests not yet forwarded
	/// (including the one that triggered the stall) are pushed back to the
	/// front of the FIFO, ahead of anything scheduled meanwhile, and the pass
	/// ends — leaving them queued for the next one.
	async fn forward_requests(self: &Arc<Self>) {
		let mut requests = std::mem::take(&mut *self.request_fifo.lock().unwrap());

		while let Some(req) = requests.pop_front() {
			let Some(client) = self.get_next_client() else {
				requests.push_front(req);
				let mut fifo = self.request_fifo.lock().unwrap();
				for leftover in requests.into_iter().rev() {
					fifo.push_front(leftover);
				}
				return;
			};

			let server_addr = match client.addr {
				SocketAddr::V4(v4) => v4,
				SocketAddr::V6(_) => unreachable!("upstream clients are always constructed from an ipv4 config"),
			};

			let request_id = {
				let mut pending = self.pending.lock().unwrap();
				let mut id_gen = self.id_gen.lock().unwrap();
				let id = id_gen.generate_unique(|candidate| pending.contains_key(&candidate));
				pending.insert(
					id,
					PendingRequest {
						request_id: id,
						listener_id: req.listener_id,
						client_addr: req.client_addr,
						client_port: req.client_port,
						server_addr: *server_addr.ip(),
						server_port: server_addr.port(),
						arrival_time_ms: req.arrival_time_ms,
						fwd_time_us: now_us(),
					},
				);
				id
			};

			// The upstream echoes request_id back as the first 8 bytes of its
			// response, so it must travel as the first 8 bytes of the request
			// too; TcpUpstreamClient::send transmits its payload verbatim.
			let mut wire = Vec::with_capacity(8 + req.payload.len());
			wire.extend_from_slice(&request_id.to_ne_bytes());
			wire.extend_from_slice(&req.payload);

			// Send rejection (disconnected between selection and send, a
			// duplicate id, or an empty payload) is treated as an immediate
			// synthetic timeout rather than left to leak until shutdown.
			if client.send(request_id, Bytes::from(wire)).await == SendOutcome::Rejected
				&& let Some(pr) = self.pending.lock().unwrap().remove(&request_id)
			{
				self.emit_edr(Edr {
					arrival_time_ms: pr.arrival_time_ms,
					tcp_resp_dur_us: TIMESTAMP_TIMEOUT,
					client_addr: pr.client_addr,
					client_port: pr.client_port,
					server_addr: pr.server_addr,
					server_port: pr.server_port,
				});
			}
		}
	}

	/// Drains the response FIFO fully: settles each response against the
	/// pending table, emits its EDR, and — unless it was a timeout — hands
	/// the payload back to the originating listener for the UDP reply.
	async fn send_responses(self: &Arc<Self>) {
		let responses = std::mem::take(&mut *self.response_fifo.lock().unwrap());

		for resp in responses {
			let pr = self.pending.lock().unwrap().remove(&resp.request_id);
			let Some(pr) = pr else {
				forwarder_core::warn!("response for unknown or already-settled request {}", resp.request_id);
				continue;
			};

			let tcp_resp_dur_us =
				if resp.is_timeout() { TIMESTAMP_TIMEOUT } else { resp.resp_timestamp_us.saturating_sub(pr.fwd_time_us) };

			self.emit_edr(Edr {
				arrival_time_ms: pr.arrival_time_ms,
				tcp_resp_dur_us,
				client_addr: pr.client_addr,
				client_port: pr.client_port,
				server_addr: pr.server_addr,
				server_port: pr.server_port,
			});

			if resp.is_timeout() {
				continue;
			}

			let Some(listener) = self.listeners.get(&pr.listener_id) else {
				forwarder_core::warn!("no listener registered for listener_id {}", pr.listener_id);
				continue;
			};
			let peer = SocketAddr::new(pr.client_addr.into(), pr.client_port);
			listener.send(peer, &resp.payload).await;
		}
	}

	fn emit_edr(&self, edr: Edr) {
		self.edr_report.invoke(&edr);
	}

	/// Stops the worker loop, joins it, then establishes a quiescent state by
	/// acquiring the pending, request, and response locks in that order.
	/// Every request still in the pending table at that point produces a
	/// terminal EDR with `TIMESTAMP_TIMEOUT`. Finally unsubscribes from every
	/// client's `response_ready`.
	pub async fn stop(&self) {
		self.stop_flag.cancel();
		let worker = self.worker.lock().unwrap().take();
		if let Some(worker) = worker {
			let _ = worker.await;
		}

		let mut pending = self.pending.lock().unwrap();
		let requests = self.request_fifo.lock().unwrap();
		let responses = self.response_fifo.lock().unwrap();

		for (_, pr) in pending.drain() {
			self.edr_report.invoke(&Edr {
				arrival_time_ms: pr.arrival_time_ms,
				tcp_resp_dur_us: TIMESTAMP_TIMEOUT,
				client_addr: pr.client_addr,
				client_port: pr.client_port,
				server_addr: pr.server_addr,
				server_port: pr.server_port,
			});
		}
		drop(pending);
		drop(requests);
		drop(responses);

		let tokens = self.response_tokens.lock().unwrap().drain(..).collect::<Vec<_>>();
		for (client, token) in self.clients.iter().zip(tokens) {
			client.response_ready.unsubscribe(token);
		}
	}
}
