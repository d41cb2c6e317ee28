//! Ring-buffer-backed readable stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tracing::{trace, warn};
use xeno_queue::ChildQueue;
use xeno_ring::RingBuffer;

use crate::error::IoError;
use crate::handle::BoxedReader;

/// Bounded chunk size per OS read call; large enough to amortize syscalls,
/// small enough that one read cannot single-handedly overflow a
/// [`RingBuffer::DEFAULT_CAPACITY`]-sized buffer.
const MAX_CHUNK: usize = 16 * 1024;

/// `idle -> reading -> paused (buffer full) -> reading -> eof/error -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
	Idle,
	Reading,
	Paused,
	Eof,
	Error,
	Closed,
}

/// What the user callback is told about, delivered as a posted event rather
/// than invoked inline from the reactor completion.
#[derive(Debug)]
pub enum ReadOutcome {
	/// Bytes newly available, already drained out of the ring buffer.
	Data(Vec<u8>),
	Eof,
	Error(IoError),
}

struct Inner {
	ring: RingBuffer,
	reader: Option<BoxedReader>,
	state: ReadState,
	paused_by_backpressure: Arc<AtomicBool>,
	callback: Option<Arc<dyn Fn(ReadOutcome) + Send + Sync>>,
}

/// A readable stream: a ring buffer, an I/O handle, and a user callback.
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct ReadableStream {
	inner: Arc<Mutex<Inner>>,
	queue: Arc<ChildQueue>,
}

impl ReadableStream {
	/// Create an unbound stream with the given ring buffer capacity. The
	/// stream registers itself for the ring's full/nonfull notifications so
	/// it can suspend and resume its own reads transparently to the caller.
	///
	/// Takes the child queue as an `Arc` (rather than owning it outright) so
	/// a caller that needs to keep polling the same queue directly — e.g. to
	/// focus-poll it during a synchronous call — can retain its own clone.
	#[must_use]
	pub fn new(capacity: usize, queue: Arc<ChildQueue>) -> Self {
		let mut ring = RingBuffer::new(capacity);
		let paused = Arc::new(AtomicBool::new(false));
		{
			let p = paused.clone();
			ring.set_on_full(move || p.store(true, Ordering::SeqCst));
		}
		{
			let p = paused.clone();
			ring.set_on_nonfull(move || p.store(false, Ordering::SeqCst));
		}
		Self {
			inner: Arc::new(Mutex::new(Inner {
				ring,
				reader: None,
				state: ReadState::Idle,
				paused_by_backpressure: paused,
				callback: None,
			})),
			queue,
		}
	}

	/// Register (or replace) the completion callback.
	pub fn set_callback<F: Fn(ReadOutcome) + Send + Sync + 'static>(&self, cb: F) {
		self.inner.lock().unwrap().callback = Some(Arc::new(cb));
	}

	/// Bind an I/O handle's readable half. Replaces any previous binding.
	/// The stream stays idle until [`Self::start`] is called.
	pub fn bind(&self, reader: BoxedReader) {
		self.inner.lock().unwrap().reader = Some(reader);
	}

	/// Current state, primarily for tests and diagnostics.
	pub fn state(&self) -> ReadState {
		self.inner.lock().unwrap().state
	}

	/// Start (or resume) reading. A no-op once the stream has reached
	/// `eof`/`error`/`closed`.
	pub fn start(&self) {
		let mut inner = self.inner.lock().unwrap();
		match inner.state {
			ReadState::Eof | ReadState::Error | ReadState::Closed => return,
			ReadState::Reading => return,
			ReadState::Idle | ReadState::Paused => {}
		}
		if inner.reader.is_none() {
			return;
		}
		inner.state = ReadState::Reading;
		drop(inner);
		let handle = self.clone();
		tokio::spawn(async move { handle.pump().await });
	}

	/// Stop reading. Takes effect once any in-flight OS read completes;
	/// buffered data already committed is preserved.
	pub fn stop(&self) {
		let mut inner = self.inner.lock().unwrap();
		if inner.state == ReadState::Reading {
			inner.state = ReadState::Idle;
		}
	}

	/// Drain, close, and release. Safe to call after EOF.
	pub fn free(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.reader = None;
		inner.state = ReadState::Closed;
	}

	fn deliver(&self, outcome: ReadOutcome) {
		let cb = self.inner.lock().unwrap().callback.clone();
		if let Some(cb) = cb {
			self.queue.push_fn(move || cb(outcome));
		}
	}

	/// Post a deferred drain: the ring is not touched here, only once the
	/// posted event actually runs. This is what makes the ring buffer's
	/// capacity the real backpressure bound — bytes sit in it, unread,
	/// until whoever is draining the loop's queue gets to this event.
	fn post_delivery(&self) {
		let handle = self.clone();
		self.queue.push_fn(move || handle.drain_available());
	}

	/// Drain whatever is currently buffered and deliver it, resuming the
	/// pump if backpressure had suspended it. Exposed so a caller driving
	/// the loop manually can flush without waiting for the next tick.
	pub fn drain_available(&self) {
		let (bytes, was_paused, should_resume) = {
			let mut inner = self.inner.lock().unwrap();
			if inner.ring.is_empty() {
				return;
			}
			let was_paused = inner.state == ReadState::Paused;
			let bytes = inner.ring.drain_to_vec();
			let should_resume = was_paused && !inner.paused_by_backpressure.load(Ordering::SeqCst);
			if should_resume {
				inner.state = ReadState::Reading;
			}
			(bytes, was_paused, should_resume)
		};
		if !bytes.is_empty() {
			self.deliver(ReadOutcome::Data(bytes));
		}
		if was_paused && should_resume {
			let handle = self.clone();
			tokio::spawn(async move { handle.pump().await });
		}
	}

	async fn pump(&self) {
		loop {
			let (mut reader, chunk_len) = {
				let mut inner = self.inner.lock().unwrap();
				if inner.state != ReadState::Reading {
					return;
				}
				let reader = match inner.reader.take() {
					Some(r) => r,
					None => return,
				};
				let space = inner.ring.space();
				(reader, space.min(MAX_CHUNK))
			};

			if chunk_len == 0 {
				// Ring is full: zero-length read tolerated, suspend until
				// drained.
				let mut inner = self.inner.lock().unwrap();
				inner.reader = Some(reader);
				inner.state = ReadState::Paused;
				trace!("readable stream paused: ring buffer full");
				return;
			}

			let mut scratch = vec![0u8; chunk_len];
			let read_result = reader.read(&mut scratch).await;

			match read_result {
				Ok(0) => {
					let mut inner = self.inner.lock().unwrap();
					inner.reader = None;
					inner.state = ReadState::Eof;
					let leftover = if inner.ring.is_empty() {
						None
					} else {
						Some(inner.ring.drain_to_vec())
					};
					drop(inner);
					if let Some(bytes) = leftover {
						self.deliver(ReadOutcome::Data(bytes));
					}
					self.deliver(ReadOutcome::Eof);
					return;
				}
				Ok(n) => {
					let mut inner = self.inner.lock().unwrap();
					inner.reader = Some(reader);
					inner.ring.write(&scratch[..n]);
					let paused = inner.paused_by_backpressure.load(Ordering::SeqCst);
					if paused {
						inner.state = ReadState::Paused;
					}
					drop(inner);
					self.post_delivery();
					if paused {
						trace!("readable stream paused: ring buffer full");
						return;
					}
				}
				Err(err) => {
					let mut inner = self.inner.lock().unwrap();
					inner.reader = None;
					inner.state = ReadState::Error;
					drop(inner);
					warn!(error = %err, "readable stream read error");
					self.deliver(ReadOutcome::Error(IoError::Io(err)));
					return;
				}
			}
		}
	}
}
