//! Child process supervisor.
//!
//! Spawns a child, wires its stdio as bound `xeno_io` streams, and reaps it
//! through a TERM-then-KILL escalation. A process is only fully released once
//! its exit callback has fired *and* every resource it owns (the piped
//! output streams and the exit watcher itself) has been released.

mod error;

pub use error::ProcessError;

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error, warn};
use xeno_io::{handle, ReadOutcome, ReadableStream, WritableStream};
use xeno_queue::{ChildQueue, Queue};

/// Default escalation grace period between TERM and KILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Default grace window after reactor-reported exit during which buffered
/// stdout/stderr bytes are still allowed to drain before `exit_cb` fires.
pub const DEFAULT_EOF_GRACE: Duration = Duration::from_millis(50);

/// How a given stdio stream should be wired when spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioPolicy {
	Piped,
	Inherit,
	Null,
}

impl StdioPolicy {
	fn into_stdio(self) -> Stdio {
		match self {
			StdioPolicy::Piped => Stdio::piped(),
			StdioPolicy::Inherit => Stdio::inherit(),
			StdioPolicy::Null => Stdio::null(),
		}
	}
}

/// What to spawn and how to wire its stdio.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
	pub command: String,
	pub args: Vec<String>,
	pub cwd: Option<PathBuf>,
	pub env: Vec<(String, String)>,
	pub stdin: StdioPolicy,
	pub stdout: StdioPolicy,
	pub stderr: StdioPolicy,
}

impl ProcessSpec {
	#[must_use]
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			args: Vec::new(),
			cwd: None,
			env: Vec::new(),
			stdin: StdioPolicy::Piped,
			stdout: StdioPolicy::Piped,
			stderr: StdioPolicy::Piped,
		}
	}

	#[must_use]
	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	#[must_use]
	pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	#[must_use]
	pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}

	#[must_use]
	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}
}

/// Exit status of a reaped child, normalized across the libc exit-code /
/// signal-number split.
#[derive(Debug, Clone, Copy)]
pub struct ExitOutcome {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitOutcome {
	fn from(status: std::process::ExitStatus) -> Self {
		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
	Running,
	Stopping,
	Exited,
}

struct Inner {
	pid: u32,
	state: Mutex<RunState>,
	stopped_time: Mutex<Option<Instant>>,
	pending_streams: AtomicUsize,
	exit_status: Mutex<Option<ExitOutcome>>,
	exit_fired: AtomicBool,
	refcount: AtomicUsize,
	exit_cb: Mutex<Option<Box<dyn FnOnce(Option<ExitOutcome>) + Send>>>,
}

impl Inner {
	fn release(&self) {
		let remaining = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
		debug!(pid = self.pid, remaining, "process resource released");
	}

	/// Fire `exit_cb` exactly once, either because both stdio streams have
	/// reached EOF or because the EOF-grace timer elapsed first.
	fn maybe_fire_exit(&self, forced: bool) {
		let status = *self.exit_status.lock().unwrap();
		let Some(status) = status else { return };
		if !forced && self.pending_streams.load(Ordering::SeqCst) > 0 {
			return;
		}
		if self
			.exit_fired
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}
		*self.state.lock().unwrap() = RunState::Exited;
		if let Some(cb) = self.exit_cb.lock().unwrap().take() {
			cb(Some(status));
		}
		self.release();
	}
}

/// A running (or reaped) child process and its bound stdio streams.
pub struct Process {
	inner: Arc<Inner>,
	pub stdin: Option<WritableStream>,
	pub stdout: Option<ReadableStream>,
	pub stderr: Option<ReadableStream>,
}

impl Process {
	pub fn pid(&self) -> u32 {
		self.inner.pid
	}

	pub fn exit_status(&self) -> Option<ExitOutcome> {
		*self.inner.exit_status.lock().unwrap()
	}

	/// When `stop` was called, if it has been.
	pub fn stopped_time(&self) -> Option<Instant> {
		*self.inner.stopped_time.lock().unwrap()
	}

	/// Register the callback fired exactly once, on exit.
	pub fn set_exit_cb<F: FnOnce(Option<ExitOutcome>) + Send + 'static>(&self, cb: F) {
		*self.inner.exit_cb.lock().unwrap() = Some(Box::new(cb));
	}

	/// Send TERM immediately; a background task escalates to KILL after
	/// `grace` if the process has not exited by then.
	pub fn stop(&self, grace: Duration) {
		let mut state = self.inner.state.lock().unwrap();
		if *state != RunState::Running {
			return;
		}
		*state = RunState::Stopping;
		*self.inner.stopped_time.lock().unwrap() = Some(Instant::now());
		drop(state);

		// SAFETY: kill(2) with a valid pid and a standard signal number;
		// ESRCH (already exited) is an expected, harmless outcome.
		unsafe {
			libc::kill(self.inner.pid as libc::pid_t, libc::SIGTERM);
		}

		let inner = self.inner.clone();
		tokio::spawn(async move {
			tokio::time::sleep(grace).await;
			if *inner.state.lock().unwrap() == RunState::Exited {
				return;
			}
			warn!(pid = inner.pid, "escalating to SIGKILL after grace period");
			unsafe {
				libc::kill(inner.pid as libc::pid_t, libc::SIGKILL);
			}
		});
	}
}

/// Spawns children and reaps them. Every stream it binds gets its own child
/// of `events`, the fast-event queue shared with the rest of the loop.
pub struct Supervisor {
	events: Queue,
	eof_grace: Duration,
	read_buffer_capacity: usize,
}

impl Supervisor {
	#[must_use]
	pub fn new(events: Queue) -> Self {
		Self {
			events,
			eof_grace: DEFAULT_EOF_GRACE,
			read_buffer_capacity: 0,
		}
	}

	#[must_use]
	pub fn with_eof_grace(mut self, grace: Duration) -> Self {
		self.eof_grace = grace;
		self
	}

	/// Capacity of the ring buffer behind each piped stdout/stderr stream
	/// this supervisor binds; `0` falls back to
	/// `xeno_ring::RingBuffer::DEFAULT_CAPACITY`.
	#[must_use]
	pub fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
		self.read_buffer_capacity = capacity;
		self
	}

	/// Spawn a child per `spec`. stdin/stdout/stderr are wired as bound
	/// streams when their policy is `Piped`; the child-death watcher starts
	/// immediately (there is no separate lazy-start step once any child
	/// exists, since each spawn owns its own waiter task).
	pub fn spawn(&self, spec: ProcessSpec) -> Result<Process, ProcessError> {
		let mut command = Command::new(&spec.command);
		command
			.args(&spec.args)
			.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
			.stdin(spec.stdin.into_stdio())
			.stdout(spec.stdout.into_stdio())
			.stderr(spec.stderr.into_stdio());
		if let Some(cwd) = &spec.cwd {
			command.current_dir(cwd);
		}

		let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
			command: spec.command.clone(),
			source,
		})?;
		let pid = child.id().unwrap_or(0);

		let piped_outputs =
			usize::from(spec.stdout == StdioPolicy::Piped) + usize::from(spec.stderr == StdioPolicy::Piped);

		let inner = Arc::new(Inner {
			pid,
			state: Mutex::new(RunState::Running),
			stopped_time: Mutex::new(None),
			pending_streams: AtomicUsize::new(piped_outputs),
			exit_status: Mutex::new(None),
			exit_fired: AtomicBool::new(false),
			// one for the waiter task, one per piped output stream; stdin
			// has no natural "closed" notification to release on, so it is
			// not counted (the process record's release still only ever
			// waits on resources that can actually signal completion).
			refcount: AtomicUsize::new(1 + piped_outputs),
			exit_cb: Mutex::new(None),
		});

		let stdin = child.stdin.take().map(|h| {
			let stream = WritableStream::new(xeno_io::DEFAULT_MAX_PENDING, self.events.new_child());
			stream.bind(handle::child_stdin(h).split().1.expect("pipe has a write half"));
			stream
		});

		let stdout = child.stdout.take().map(|h| {
			bind_readable_output(
				handle::child_stdout(h),
				self.events.new_child(),
				&inner,
				self.read_buffer_capacity,
			)
		});

		let stderr = child.stderr.take().map(|h| {
			bind_readable_output(
				handle::child_stderr(h),
				self.events.new_child(),
				&inner,
				self.read_buffer_capacity,
			)
		});

		let waiter_inner = inner.clone();
		let eof_grace = self.eof_grace;
		tokio::spawn(async move {
			let status = child.wait().await;
			match status {
				Ok(status) => {
					*waiter_inner.exit_status.lock().unwrap() = Some(status.into());
				}
				Err(err) => {
					error!(pid = waiter_inner.pid, error = %err, "failed to reap child");
					*waiter_inner.exit_status.lock().unwrap() = Some(ExitOutcome {
						code: None,
						signal: None,
					});
				}
			}
			waiter_inner.maybe_fire_exit(false);
			tokio::time::sleep(eof_grace).await;
			waiter_inner.maybe_fire_exit(true);
			waiter_inner.release();
		});

		Ok(Process {
			inner,
			stdin,
			stdout,
			stderr,
		})
	}

	/// Stop every tracked child (caller-provided) with TERM, then KILL after
	/// `grace`, and wait up to `budget` total for them to exit. Children
	/// still alive past `budget` are abandoned with an error log.
	pub async fn teardown(&self, children: &[Process], grace: Duration, budget: Duration) {
		for child in children {
			child.stop(grace);
		}
		let deadline = Instant::now() + budget;
		for child in children {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				error!(pid = child.pid(), "abandoning child: teardown budget exceeded");
				continue;
			}
			if tokio::time::timeout(remaining, wait_for_exit(&child.inner))
				.await
				.is_err()
			{
				error!(pid = child.pid(), "abandoning child: teardown budget exceeded");
			}
		}
	}
}

async fn wait_for_exit(inner: &Arc<Inner>) {
	loop {
		if *inner.state.lock().unwrap() == RunState::Exited {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

/// Bind a piped stdout/stderr handle as a readable stream whose EOF/error
/// completion counts down `inner.pending_streams`, the gate the EOF-grace
/// timer races against.
fn bind_readable_output(
	raw: Box<dyn xeno_io::IoHandle>,
	queue: ChildQueue,
	inner: &Arc<Inner>,
	read_buffer_capacity: usize,
) -> ReadableStream {
	let (reader, _writer) = raw.split();
	let reader = reader.expect("pipe output has a read half");
	let stream = ReadableStream::new(read_buffer_capacity, Arc::new(queue));
	let watch = inner.clone();
	stream.set_callback(move |outcome| {
		if matches!(outcome, ReadOutcome::Eof | ReadOutcome::Error(_)) {
			watch.pending_streams.fetch_sub(1, Ordering::SeqCst);
			watch.maybe_fire_exit(false);
			watch.release();
		}
	});
	stream.bind(reader);
	stream.start();
	stream
}
