//! The loop driver: a thin synchronous façade over a single-threaded Tokio
//! runtime.
//!
//! `Queue::poll` is a genuine OS-level `Condvar` wait — deliberately, so it
//! has no dependency on an async executor and can be the primitive every
//! other layer posts *into* (see `xeno_queue`). That means the one place in
//! this whole workspace where a blocking wait and a single-threaded runtime
//! must coexist is right here: [`Loop::poll_events`] bridges the two by
//! running the blocking poll on Tokio's blocking thread pool
//! (`tokio::task::spawn_blocking`) and `.await`-ing it from inside
//! `block_on`. That keeps the runtime's own worker thread free to keep
//! polling whatever `tokio::spawn`ed stream pumps and process waiters are
//! in flight the whole time the poll is outstanding, exactly the way
//! `tokio::fs` bridges blocking file I/O onto an async runtime.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;
use xeno_queue::{Queue, QueueWaker};

use crate::error::CoreError;

thread_local! {
	static POLLING: Cell<bool> = const { Cell::new(false) };
}

/// Owns the fast and deferred event queues and the runtime that drives
/// every async primitive (`xeno_io` streams, `xeno_process` waiters,
/// `xeno_rpc` channels) posting into them.
pub struct Loop {
	fast: Queue,
	deferred: Queue,
	deferred_enabled: AtomicBool,
	rt: tokio::runtime::Runtime,
	closed: AtomicBool,
	close_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Loop {
	/// Build a new loop driver with its own current-thread Tokio runtime.
	pub fn new() -> Result<Self, CoreError> {
		let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
		Ok(Self {
			fast: Queue::new(),
			deferred: Queue::new(),
			deferred_enabled: AtomicBool::new(false),
			rt,
			closed: AtomicBool::new(false),
			close_hooks: Mutex::new(Vec::new()),
		})
	}

	/// The fast event queue: stream completions, process exits, signals, and
	/// RPC frame dispatch all land here by default.
	pub fn fast_queue(&self) -> &Queue {
		&self.fast
	}

	/// The deferred event queue: drained only when [`Self::enable_deferred`]
	/// has been called, and only after the fast queue has nothing ready.
	pub fn deferred_queue(&self) -> &Queue {
		&self.deferred
	}

	pub fn enable_deferred(&self) {
		self.deferred_enabled.store(true, Ordering::SeqCst);
	}

	pub fn disable_deferred(&self) {
		self.deferred_enabled.store(false, Ordering::SeqCst);
	}

	/// A handle any thread may use to interrupt a blocked [`Self::poll_events`]
	/// immediately, e.g. after a cross-thread producer pushes work.
	pub fn waker(&self) -> QueueWaker {
		self.fast.waker()
	}

	/// Request the reactor to return from whatever [`Self::poll_events`] call
	/// is currently blocked, immediately, without waiting for a new event.
	/// Safe to call from any thread, including while nothing is blocked (the
	/// interrupt is simply observed by the next `poll_events` call instead).
	pub fn stop(&self) {
		self.waker().wake();
	}

	/// Register a hook to run exactly once, the first time [`Self::close`] is
	/// called — the mechanism an owner of handles bound to this loop (a
	/// `Supervisor`, a `Channel`) uses to release them without `Loop` itself
	/// having to know their concrete type.
	pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
		self.close_hooks.lock().unwrap().push(Box::new(hook));
	}

	/// Close owned handles and run the reactor until both queues are empty.
	/// Idempotent: every call after the first is a no-op, so embedders don't
	/// need to track whether they already closed a given loop.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let hooks: Vec<_> = self.close_hooks.lock().unwrap().drain(..).collect();
		for hook in hooks {
			hook();
		}
		let was_deferred = self.deferred_enabled.swap(true, Ordering::SeqCst);
		while !self.fast.is_empty() || !self.deferred.is_empty() {
			if !self.poll_once(0).unwrap_or(false) {
				break;
			}
		}
		self.deferred_enabled.store(was_deferred, Ordering::SeqCst);
	}

	/// A handle onto this loop's own Tokio runtime, for callers that need to
	/// spawn long-lived tasks (a channel's reader pump, a process watcher)
	/// bound to this loop's lifetime rather than an ambient runtime.
	pub fn handle(&self) -> tokio::runtime::Handle {
		self.rt.handle().clone()
	}

	/// Poll once: drain one fast event if any is ready, else one deferred
	/// event if deferred draining is enabled, else wait up to `timeout_ms`
	/// (negative blocks indefinitely, zero never blocks). Returns whether an
	/// event was invoked.
	///
	/// Panics if called again from inside an event callback this same call is
	/// still in the middle of invoking, on the same thread: re-entry is a
	/// contract violation (not a recoverable condition), matching the abort
	/// nvim's own loop performs on the equivalent misuse.
	pub fn poll_events(&self, timeout_ms: i64) -> Result<bool, CoreError> {
		if POLLING.with(|p| p.replace(true)) {
			panic!("Loop::poll_events called re-entrantly from inside one of its own callbacks");
		}
		let result = self.poll_once(timeout_ms);
		POLLING.with(|p| p.set(false));
		result
	}

	fn poll_once(&self, timeout_ms: i64) -> Result<bool, CoreError> {
		let fast = self.fast.clone();
		let deferred = self.deferred.clone();
		let deferred_enabled = self.deferred_enabled.load(Ordering::SeqCst);

		let wait = async move {
			if let Some(event) = tokio::task::spawn_blocking(move || fast.poll(timeout_ms)).await? {
				event.invoke();
				return Ok(true);
			}
			if deferred_enabled {
				if let Some(event) = tokio::task::spawn_blocking(move || deferred.poll(0)).await? {
					event.invoke();
					return Ok(true);
				}
			}
			Ok(false)
		};

		self.rt.block_on(async {
			if timeout_ms < 0 {
				wait.await
			} else {
				match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), wait).await {
					Ok(result) => result,
					Err(_) => {
						trace!("poll_events timed out waiting for fast/deferred event");
						Ok(false)
					}
				}
			}
		})
	}

	/// Re-enter the loop repeatedly until `done` returns true or `timeout_ms`
	/// elapses (`timeout_ms <= 0` means no deadline: keep going until `done`
	/// is satisfied). Returns `true` if `done` was satisfied, `false` if the
	/// deadline elapsed first. This is how a blocking foreground operation (a
	/// synchronous RPC call, a modal prompt) keeps the reactor alive without
	/// duplicating `poll_events`'s bridging logic — the same pattern nvim's
	/// `process_events_until` uses to implement `rpcrequest()` on top of its
	/// own main loop.
	///
	/// The remaining wait is recomputed against a monotonic deadline on every
	/// iteration rather than re-passing `timeout_ms` unchanged to each inner
	/// `poll_events` call, so events arriving before the predicate is
	/// satisfied can't each reset the clock and let the overall wait run
	/// arbitrarily long past `timeout_ms`.
	pub fn process_events_until(&self, mut done: impl FnMut() -> bool, timeout_ms: i64) -> Result<bool, CoreError> {
		let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
		loop {
			if done() {
				return Ok(true);
			}
			let remaining = match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Ok(false);
					}
					deadline.saturating_duration_since(now).as_millis() as i64
				}
				None => timeout_ms,
			};
			self.poll_events(remaining)?;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::sync::Arc;

	#[test]
	fn close_runs_hooks_once_and_is_idempotent() {
		let lp = Loop::new().unwrap();
		let calls = Arc::new(AtomicUsize::new(0));
		{
			let calls = calls.clone();
			lp.on_close(move || {
				calls.fetch_add(1, Ordering::SeqCst);
			});
		}
		lp.close();
		lp.close();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn stop_unblocks_an_indefinitely_blocked_poll() {
		let lp = Arc::new(Loop::new().unwrap());
		let waiter = lp.clone();
		let handle = std::thread::spawn(move || waiter.poll_events(-1));
		std::thread::sleep(Duration::from_millis(20));
		lp.stop();
		let invoked = handle.join().unwrap().unwrap();
		assert!(!invoked, "stop() should unblock the poll with no event invoked");
	}

	#[test]
	#[should_panic(expected = "re-entrantly")]
	fn reentrant_poll_events_panics() {
		let lp = Arc::new(Loop::new().unwrap());
		let child = Arc::new(lp.fast_queue().new_child());
		{
			let lp = lp.clone();
			child.push_fn(move || {
				let _ = lp.poll_events(10);
			});
		}
		let _ = lp.poll_events(100);
	}

	#[test]
	fn process_events_until_reports_deadline_elapsed_when_predicate_never_satisfied() {
		let lp = Loop::new().unwrap();
		let satisfied = lp.process_events_until(|| false, 30).unwrap();
		assert!(!satisfied);
	}

	#[test]
	fn process_events_until_recomputes_remaining_budget_across_several_events() {
		let lp = Arc::new(Loop::new().unwrap());
		let waker = lp.waker();
		// Post a handful of fast events spaced out across the timeout window;
		// each one must not reset the overall deadline, so the predicate still
		// sees it go unsatisfied once the original budget truly elapses.
		for _ in 0..3 {
			let waker = waker.clone();
			std::thread::spawn(move || {
				std::thread::sleep(Duration::from_millis(15));
				waker.wake();
			});
		}
		let satisfied = lp.process_events_until(|| false, 60).unwrap();
		assert!(!satisfied);
	}
}
