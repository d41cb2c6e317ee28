//! Refcounted writable stream with bounded pending memory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;
use xeno_queue::ChildQueue;

use crate::error::IoError;
use crate::handle::BoxedWriter;

/// Default pending-memory budget for a writable stream.
pub const DEFAULT_MAX_PENDING: usize = 10 * 1024 * 1024;

struct BufferInner {
	data: Vec<u8>,
	finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Drop for BufferInner {
	fn drop(&mut self) {
		if let Some(f) = self.finalizer.lock().unwrap().take() {
			f();
		}
	}
}

/// A refcounted write payload. Cloning increments the refcount; the
/// finalizer fires exactly when the last clone is dropped — `Arc`'s own
/// drop glue stands in for the manual refcount the ancestor design tracks
/// by hand.
#[derive(Clone)]
pub struct WriteBuffer {
	inner: Arc<BufferInner>,
}

impl WriteBuffer {
	#[must_use]
	pub fn new(data: Vec<u8>) -> Self {
		Self::with_finalizer(data, || {})
	}

	pub fn with_finalizer<F: FnOnce() + Send + 'static>(data: Vec<u8>, finalizer: F) -> Self {
		Self {
			inner: Arc::new(BufferInner {
				data,
				finalizer: Mutex::new(Some(Box::new(finalizer))),
			}),
		}
	}

	pub fn len(&self) -> usize {
		self.inner.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.data.is_empty()
	}
}

/// Outcome of a completed write, dispatched to the write callback as an
/// event in completion order (which, on ordered transports, equals
/// submission order since a single task drains the job queue serially).
#[derive(Debug)]
pub enum WriteOutcome {
	Ok,
	Err(IoError),
}

struct Job {
	buf: WriteBuffer,
}

struct State {
	max: usize,
	pending_bytes: AtomicUsize,
	pending_reqs: AtomicUsize,
	freed: AtomicBool,
	job_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
	callback: Mutex<Option<Arc<dyn Fn(WriteOutcome) + Send + Sync>>>,
	queue: ChildQueue,
}

/// A writable stream: a handle, a tracked pending-byte count, a limit, and a
/// pending-request count.
#[derive(Clone)]
pub struct WritableStream {
	state: Arc<State>,
}

impl WritableStream {
	/// Create an unbound stream with the given pending-memory budget.
	#[must_use]
	pub fn new(max: usize, queue: ChildQueue) -> Self {
		let max = if max == 0 { DEFAULT_MAX_PENDING } else { max };
		Self {
			state: Arc::new(State {
				max,
				pending_bytes: AtomicUsize::new(0),
				pending_reqs: AtomicUsize::new(0),
				freed: AtomicBool::new(false),
				job_tx: Mutex::new(None),
				callback: Mutex::new(None),
				queue,
			}),
		}
	}

	/// Register (or replace) the write-completion callback.
	pub fn set_write_callback<F: Fn(WriteOutcome) + Send + Sync + 'static>(&self, cb: F) {
		*self.state.callback.lock().unwrap() = Some(Arc::new(cb));
	}

	/// Bind a writable half and start the background writer task that owns
	/// it. Writes submitted before binding are rejected.
	pub fn bind(&self, writer: BoxedWriter) {
		let (tx, rx) = mpsc::unbounded_channel();
		*self.state.job_tx.lock().unwrap() = Some(tx);
		let state = self.state.clone();
		tokio::spawn(run_writer(writer, rx, state));
	}

	pub fn pending_bytes(&self) -> usize {
		self.state.pending_bytes.load(Ordering::SeqCst)
	}

	pub fn pending_reqs(&self) -> usize {
		self.state.pending_reqs.load(Ordering::SeqCst)
	}

	/// Submit a buffer for writing. Returns `true` if accepted. On
	/// rejection the buffer's refcount is still decremented (it is simply
	/// dropped here, same as every other path out of this function).
	pub fn write(&self, buf: WriteBuffer) -> bool {
		if self.state.freed.load(Ordering::SeqCst) {
			return false;
		}
		let len = buf.len();
		let pending = self.state.pending_bytes.load(Ordering::SeqCst);
		if pending + len > self.state.max {
			return false;
		}
		let tx = match self.state.job_tx.lock().unwrap().as_ref() {
			Some(tx) => tx.clone(),
			None => return false,
		};
		self.state.pending_bytes.fetch_add(len, Ordering::SeqCst);
		self.state.pending_reqs.fetch_add(1, Ordering::SeqCst);
		if tx.send(Job { buf }).is_err() {
			self.state.pending_bytes.fetch_sub(len, Ordering::SeqCst);
			self.state.pending_reqs.fetch_sub(1, Ordering::SeqCst);
			return false;
		}
		true
	}

	/// Mark the stream freed. Actual release — dropping the writer and
	/// closing the underlying handle — happens once the background task
	/// drains whatever was already submitted and `pending_reqs` reaches
	/// zero; this only stops *new* submissions.
	pub fn free(&self) {
		self.state.freed.store(true, Ordering::SeqCst);
		self.state.job_tx.lock().unwrap().take();
	}
}

async fn run_writer(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<Job>, state: Arc<State>) {
	while let Some(job) = rx.recv().await {
		let len = job.buf.len();
		let result = writer.write_all(&job.buf.inner.data).await;
		state.pending_bytes.fetch_sub(len, Ordering::SeqCst);
		state.pending_reqs.fetch_sub(1, Ordering::SeqCst);

		let outcome = match &result {
			Ok(()) => WriteOutcome::Ok,
			Err(err) => {
				warn!(error = %err, "writable stream write error");
				WriteOutcome::Err(IoError::Io(std::io::Error::new(err.kind(), err.to_string())))
			}
		};
		let cb = state.callback.lock().unwrap().clone();
		if let Some(cb) = cb {
			state.queue.push_fn(move || cb(outcome));
		}
		if result.is_err() {
			break;
		}
	}
	// `writer` drops here, closing the underlying handle once every
	// submitted job has been drained — the release the ancestor design
	// gates on `pending_reqs == 0`.
}
