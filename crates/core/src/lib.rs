//! Facade wiring the ring buffer, linked queue, I/O streams, process
//! supervisor, and RPC channel layer into one event core: a single main
//! loop serving editor input, child-process and network I/O, timers, and
//! signals from one thread, while every blocking wait that thread performs
//! is bridged onto a Tokio reactor so nothing else in the system stalls
//! behind it. See [`loop_driver::Loop`] for how that bridge works.

pub mod config;
pub mod error;
pub mod loop_driver;
pub mod signal;
pub mod stdio;
pub mod timer;

pub use config::{init_tracing, Config};
pub use error::CoreError;
pub use loop_driver::Loop;
pub use signal::SignalWatcher;
pub use stdio::select_input_fd;
pub use timer::Timer;

use std::sync::Arc;
use std::time::Duration;

use xeno_io::{BoxedReader, BoxedWriter};
use xeno_process::{Process, ProcessError, ProcessSpec, Supervisor};
use xeno_rpc::{Channel, ChannelRegistry, MethodRegistry, Value};

/// The event core: owns the loop driver, the process supervisor bound to
/// its fast queue, and (once [`Self::watch_signals`] is called) the deadly
/// signal watcher. RPC channels are bound on demand via [`Self::bind_channel`]
/// and tracked in a [`ChannelRegistry`] so [`Self::broadcast`] can reach every
/// one of them without an embedder threading its own collection through.
pub struct EventCore {
	loop_driver: Loop,
	config: Config,
	processes: Supervisor,
	signals: Option<SignalWatcher>,
	channels: ChannelRegistry,
}

impl EventCore {
	/// Build a new event core with its own loop driver and process
	/// supervisor. Does not start watching signals; call
	/// [`Self::watch_signals`] to do that.
	pub fn new(config: Config) -> Result<Self, CoreError> {
		let loop_driver = Loop::new()?;
		let processes = Supervisor::new(loop_driver.fast_queue().clone())
			.with_eof_grace(config.eof_grace)
			.with_read_buffer_capacity(config.read_buffer_capacity);
		Ok(Self {
			loop_driver,
			config,
			processes,
			signals: None,
			channels: ChannelRegistry::new(),
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn loop_driver(&self) -> &Loop {
		&self.loop_driver
	}

	/// Poll the loop once. See [`Loop::poll_events`].
	pub fn poll_events(&self, timeout_ms: i64) -> Result<bool, CoreError> {
		self.loop_driver.poll_events(timeout_ms)
	}

	/// Re-enter the loop until `done` returns true or `timeout_ms` elapses.
	/// See [`Loop::process_events_until`].
	pub fn process_events_until(&self, done: impl FnMut() -> bool, timeout_ms: i64) -> Result<bool, CoreError> {
		self.loop_driver.process_events_until(done, timeout_ms)
	}

	/// Interrupt a blocked [`Self::poll_events`] immediately. See
	/// [`Loop::stop`].
	pub fn stop(&self) {
		self.loop_driver.stop();
	}

	/// Close owned handles and run the reactor until both queues are empty.
	/// Idempotent. See [`Loop::close`].
	pub fn close(&self) {
		self.loop_driver.close();
	}

	/// Start watching `SIGHUP`/`SIGTERM`/`SIGQUIT`/`SIGPWR`, invoking
	/// `on_deadly_signal` as a fast event whenever one arrives and
	/// reject-deadly is not armed. A no-op (replacing nothing) if called
	/// more than once; only the first watcher this call creates survives.
	pub fn watch_signals<F>(&mut self, on_deadly_signal: F)
	where
		F: Fn() + Send + Sync + 'static,
	{
		let _guard = self.loop_driver.handle().enter();
		let child = Arc::new(self.loop_driver.fast_queue().new_child());
		self.signals = Some(SignalWatcher::spawn(child, on_deadly_signal));
	}

	pub fn signal_watcher(&self) -> Option<&SignalWatcher> {
		self.signals.as_ref()
	}

	/// Spawn a child process, wiring its piped streams onto this loop's fast
	/// queue. Must run with the loop's runtime entered, since binding the
	/// child's stdio streams and death watcher both spawn background tasks.
	pub fn spawn_process(&self, spec: ProcessSpec) -> Result<Process, ProcessError> {
		let _guard = self.loop_driver.handle().enter();
		self.processes.spawn(spec)
	}

	/// Send `TERM` (then `KILL` after `grace`) to every child still running,
	/// waiting up to `budget` total before abandoning any stragglers. See
	/// `xeno_process::Supervisor::teardown`.
	pub fn teardown_processes(&self, children: &[Process], grace: Duration, budget: Duration) {
		self.loop_driver.handle().block_on(self.processes.teardown(children, grace, budget));
	}

	/// Bind a new RPC channel on this loop's fast queue and register it so
	/// [`Self::broadcast`] can reach it. Must run with the loop's runtime
	/// entered, since binding starts the channel's reader pump immediately.
	pub fn bind_channel(&self, id: u64, registry: MethodRegistry, incoming: BoxedReader, outgoing: BoxedWriter) -> Channel {
		let _guard = self.loop_driver.handle().enter();
		let channel = Channel::bind(
			id,
			self.loop_driver.fast_queue(),
			registry,
			incoming,
			outgoing,
			self.config.read_buffer_capacity,
		);
		self.channels.register(channel.clone());
		channel
	}

	/// Write a notification frame to every bound channel subscribed to
	/// `event`. See [`ChannelRegistry::broadcast`].
	pub fn broadcast(&self, event: impl Into<String>, payload: Vec<Value>) {
		self.channels.broadcast(event, payload);
	}
}
