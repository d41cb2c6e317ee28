//! A channel: one peer connection's incoming/outgoing frame traffic, pending
//! call table, and subscription set. Grounded on `crates/broker/broker/src/ipc.rs`
//! (`handle_connection`'s split-stream-plus-mainloop shape) and
//! `crates/broker/broker/src/service.rs` (`PeerSocket`-style cheap-clone handle
//! used from inside request handlers), generalized from one hardcoded
//! protocol to the named-method registry this layer provides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use xeno_io::{ReadOutcome, ReadableStream, WriteBuffer, WritableStream};
use xeno_queue::{ChildQueue, Queue};

use crate::error::RpcError;
use crate::frame::{Frame, FrameDecoder, Notification, Request, RequestId, Response};
use crate::registry::MethodRegistry;
use crate::value::Value;

/// An outstanding synchronous call's result slot. Resolves exactly once,
/// either with the peer's response or a transport error on channel teardown.
pub struct PendingCall {
	done: AtomicBool,
	slot: Mutex<Option<Result<Value, RpcError>>>,
}

impl PendingCall {
	fn new() -> Self {
		Self {
			done: AtomicBool::new(false),
			slot: Mutex::new(None),
		}
	}

	/// Resolve exactly once; later resolutions (e.g. a transport-close sweep
	/// racing a just-arrived response) are silently dropped.
	fn resolve(&self, outcome: Result<Value, RpcError>) {
		if self
			.done
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}
		*self.slot.lock().unwrap() = Some(outcome);
	}

	fn take(&self) -> Option<Result<Value, RpcError>> {
		self.slot.lock().unwrap().take()
	}

	/// Whether the call has resolved yet.
	pub fn is_done(&self) -> bool {
		self.done.load(Ordering::SeqCst)
	}
}

struct State {
	id: u64,
	outgoing: WritableStream,
	decoder: Mutex<FrameDecoder>,
	next_request_id: AtomicU64,
	pending: Mutex<HashMap<u64, Arc<PendingCall>>>,
	subscriptions: Mutex<std::collections::HashSet<String>>,
	registry: MethodRegistry,
	notify_cb: Mutex<Option<Arc<dyn Fn(Notification) + Send + Sync>>>,
	closed: AtomicBool,
}

/// A bound RPC channel: cheap to clone, every clone shares the same
/// pending-call table and subscription set.
#[derive(Clone)]
pub struct Channel {
	state: Arc<State>,
	/// This channel's own child queue — shared with its `ReadableStream` so
	/// every event this channel ever produces, from raw-data arrival through
	/// decoded-frame dispatch, lands on the one queue [`Self::call`] can
	/// focus-poll to service only this channel's traffic without touching
	/// unrelated producers (§4.2's focus-poll rationale).
	dispatch: Arc<ChildQueue>,
}

const DEFAULT_DECODE_CAPACITY: usize = 64 * 1024;

impl Channel {
	/// Bind a channel to its incoming/outgoing streams and start pumping.
	/// `parent` is the event core's fast queue; `incoming`/`outgoing` are
	/// I/O handles split from the same underlying connection (socket, pipe,
	/// or anything else `xeno_io::handle` produces). `read_buffer_capacity`
	/// sizes the incoming ring buffer; `0` falls back to
	/// `xeno_ring::RingBuffer::DEFAULT_CAPACITY`.
	#[must_use]
	pub fn bind(
		id: u64,
		parent: &Queue,
		registry: MethodRegistry,
		incoming: xeno_io::BoxedReader,
		outgoing: xeno_io::BoxedWriter,
		read_buffer_capacity: usize,
	) -> Self {
		let queue = Arc::new(parent.new_child());
		let reader_stream = ReadableStream::new(read_buffer_capacity, queue.clone());
		reader_stream.bind(incoming);

		let writer_stream = WritableStream::new(xeno_io::DEFAULT_MAX_PENDING, parent.new_child());
		writer_stream.bind(outgoing);

		let channel = Self {
			state: Arc::new(State {
				id,
				outgoing: writer_stream,
				decoder: Mutex::new(FrameDecoder::new(DEFAULT_DECODE_CAPACITY)),
				next_request_id: AtomicU64::new(1),
				pending: Mutex::new(HashMap::new()),
				subscriptions: Mutex::new(std::collections::HashSet::new()),
				registry,
				notify_cb: Mutex::new(None),
				closed: AtomicBool::new(false),
			}),
			dispatch: queue,
		};

		let on_data = channel.clone();
		reader_stream.set_callback(move |outcome| on_data.on_read_outcome(outcome));
		reader_stream.start();

		channel
	}

	pub fn id(&self) -> u64 {
		self.state.id
	}

	/// Register (or replace) the handler for notifications whose method the
	/// channel has subscribed to via [`Self::subscribe`].
	pub fn set_notify_handler<F: Fn(Notification) + Send + Sync + 'static>(&self, cb: F) {
		*self.state.notify_cb.lock().unwrap() = Some(Arc::new(cb));
	}

	pub fn subscribe(&self, event: impl Into<String>) {
		self.state.subscriptions.lock().unwrap().insert(event.into());
	}

	pub fn unsubscribe(&self, event: &str) {
		self.state.subscriptions.lock().unwrap().remove(event);
	}

	/// Whether this channel has subscribed to `event`.
	pub fn is_subscribed(&self, event: &str) -> bool {
		self.state.subscriptions.lock().unwrap().contains(event)
	}

	/// Whether the transport has already been torn down.
	pub fn is_closed(&self) -> bool {
		self.state.closed.load(Ordering::SeqCst)
	}

	/// Fire a notification to the peer; no response is expected.
	pub fn notify(&self, method: impl Into<String>, args: Vec<Value>) -> Result<(), RpcError> {
		self.write_frame(Frame::Notification(Notification {
			method: method.into(),
			args,
		}))
	}

	/// Issue a synchronous call: blocks the calling thread, focus-polling
	/// only this channel's dispatch queue, until the matching response
	/// arrives, the channel closes, or `timeout_ms` elapses (`<0` blocks
	/// indefinitely, matching [`xeno_queue::ChildQueue::poll`]'s convention).
	pub fn call(&self, method: impl Into<String>, args: Vec<Value>, timeout_ms: i64) -> Result<Value, RpcError> {
		if self.state.closed.load(Ordering::SeqCst) {
			return Err(RpcError::Closed);
		}
		let id = RequestId(self.state.next_request_id.fetch_add(1, Ordering::SeqCst));
		let call = Arc::new(PendingCall::new());
		self.state.pending.lock().unwrap().insert(id.0, call.clone());

		if let Err(err) = self.write_frame(Frame::Request(Request {
			id,
			method: method.into(),
			args,
		})) {
			self.state.pending.lock().unwrap().remove(&id.0);
			return Err(err);
		}

		// Recompute the remaining wait against a monotonic deadline on every
		// iteration rather than re-passing `timeout_ms` unchanged: otherwise
		// each intervening event (dispatched and invoked before the response
		// this call is waiting for) would reset the clock and let the overall
		// wait run arbitrarily long past `timeout_ms`.
		let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
		loop {
			if call.done.load(Ordering::SeqCst) {
				break;
			}
			let remaining = match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						self.state.pending.lock().unwrap().remove(&id.0);
						return Err(RpcError::Timeout);
					}
					deadline.saturating_duration_since(now).as_millis() as i64
				}
				None => timeout_ms,
			};
			match self.dispatch.poll(remaining) {
				Some(event) => event.invoke(),
				None => {
					self.state.pending.lock().unwrap().remove(&id.0);
					return Err(RpcError::Timeout);
				}
			}
		}
		self.state.pending.lock().unwrap().remove(&id.0);
		call.take().unwrap_or(Err(RpcError::Closed))
	}

	fn write_frame(&self, frame: Frame) -> Result<(), RpcError> {
		let bytes = postcard::to_allocvec(&frame).map_err(|e| RpcError::Decode(e.to_string()))?;
		let mut wire = (bytes.len() as u32).to_le_bytes().to_vec();
		wire.extend_from_slice(&bytes);
		if !self.state.outgoing.write(WriteBuffer::new(wire)) {
			return Err(RpcError::Closed);
		}
		Ok(())
	}

	fn on_read_outcome(&self, outcome: ReadOutcome) {
		match outcome {
			ReadOutcome::Data(bytes) => {
				let frames = {
					let mut decoder = self.state.decoder.lock().unwrap();
					if let Err(err) = decoder.feed(&bytes) {
						warn!(channel = self.state.id, error = %err, "decoder error, tearing down channel");
						drop(decoder);
						self.close_with(RpcError::Closed);
						return;
					}
					decoder.drain_frames()
				};
				match frames {
					Ok(frames) => {
						for frame in frames {
							let channel = self.clone();
							self.dispatch.push_fn(move || channel.handle_frame(frame));
						}
					}
					Err(err) => {
						warn!(channel = self.state.id, error = %err, "malformed frame, tearing down channel");
						self.close_with(RpcError::Closed);
					}
				}
			}
			ReadOutcome::Eof => self.close_with(RpcError::Closed),
			ReadOutcome::Error(err) => {
				warn!(channel = self.state.id, error = %err, "transport read error");
				self.close_with(RpcError::Io(std::io::Error::other(err.to_string())));
			}
		}
	}

	fn handle_frame(&self, frame: Frame) {
		match frame {
			Frame::Request(req) => self.handle_request(req),
			Frame::Response(resp) => self.handle_response(resp),
			Frame::Notification(notif) => self.handle_notification(notif),
		}
	}

	fn handle_request(&self, req: Request) {
		let Some(future) = self.state.registry.dispatch(&req.method, req.args) else {
			let _ = self.write_frame(Frame::Response(Response {
				id: req.id,
				result: None,
				error: Some(Value::Str(format!("unknown method: {}", req.method))),
			}));
			return;
		};
		let channel = self.clone();
		tokio::spawn(async move {
			let response = match future.await {
				Ok(result) => Response {
					id: req.id,
					result: Some(result),
					error: None,
				},
				Err(error) => Response {
					id: req.id,
					result: None,
					error: Some(error),
				},
			};
			let _ = channel.write_frame(Frame::Response(response));
		});
	}

	fn handle_response(&self, resp: Response) {
		let pending = self.state.pending.lock().unwrap().get(&resp.id.0).cloned();
		let Some(pending) = pending else {
			debug!(channel = self.state.id, id = resp.id.0, "response for unknown or already-resolved call");
			return;
		};
		let outcome = match resp.error {
			Some(err) => Err(RpcError::Remote(err)),
			None => Ok(resp.result.unwrap_or(Value::Nil)),
		};
		pending.resolve(outcome);
	}

	fn handle_notification(&self, notif: Notification) {
		if !self.state.subscriptions.lock().unwrap().contains(&notif.method) {
			return;
		}
		let cb = self.state.notify_cb.lock().unwrap().clone();
		if let Some(cb) = cb {
			cb(notif);
		}
	}

	/// Tear down: mark closed and resolve every outstanding pending call with
	/// a transport error, exactly once each.
	fn close_with(&self, err: RpcError) {
		if self
			.state
			.closed
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}
		let pending: Vec<_> = self.state.pending.lock().unwrap().drain().map(|(_, v)| v).collect();
		for call in pending {
			call.resolve(Err(match &err {
				RpcError::Remote(v) => RpcError::Remote(v.clone()),
				RpcError::Closed => RpcError::Closed,
				other => RpcError::Io(std::io::Error::other(other.to_string())),
			}));
		}
	}
}

/// Tracks every channel bound on a loop so [`Self::broadcast`] can reach
/// subscribers without each `Channel::bind` caller threading a collection
/// through by hand. Grounded on the same fan-out shape as
/// `crates/broker/broker/src/service.rs`'s peer table, generalized from one
/// fixed connection set to channels coming and going over the registry's own
/// lifetime.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
	channels: Arc<Mutex<HashMap<u64, Channel>>>,
}

impl ChannelRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Start tracking `channel`, keyed by its id. Replaces any previously
	/// registered channel with the same id.
	pub fn register(&self, channel: Channel) {
		self.channels.lock().unwrap().insert(channel.id(), channel);
	}

	/// Stop tracking the channel with this id, if any.
	pub fn unregister(&self, id: u64) {
		self.channels.lock().unwrap().remove(&id);
	}

	pub fn len(&self) -> usize {
		self.channels.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Write a notification frame to every registered channel subscribed to
	/// `event`. Channels observed already closed are dropped from the
	/// registry instead of retried on a later broadcast; a channel whose
	/// write fails is logged, not propagated, so one dead peer can't abort
	/// delivery to the rest.
	pub fn broadcast(&self, event: impl Into<String>, payload: Vec<Value>) {
		let event = event.into();
		let channels: Vec<Channel> = {
			let mut channels = self.channels.lock().unwrap();
			channels.retain(|_, channel| !channel.is_closed());
			channels.values().cloned().collect()
		};
		for channel in channels {
			if !channel.is_subscribed(&event) {
				continue;
			}
			if let Err(err) = channel.notify(event.clone(), payload.clone()) {
				warn!(channel = channel.id(), error = %err, "broadcast notify failed");
			}
		}
	}
}
