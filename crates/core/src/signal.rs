//! Deadly-signal watcher: `SIGHUP`/`SIGTERM`/`SIGQUIT`/`SIGPWR` drive a
//! preserve-and-exit path unless an editor-controlled flag has disarmed it
//! for a critical section, in which case the signal is dropped on the floor
//! rather than queued for later delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};
use xeno_queue::ChildQueue;

/// Watches the deadly signals and calls back onto a queue's event stream.
///
/// Construct with [`SignalWatcher::spawn`]; the returned handle controls
/// whether the watcher currently delivers or rejects those signals.
pub struct SignalWatcher {
	reject_deadly: Arc<AtomicBool>,
}

impl SignalWatcher {
	/// Ignore `SIGPIPE` globally (nothing in this workspace wants the default
	/// terminate-on-broken-pipe behavior; writes report the error instead)
	/// and start watching the deadly signals, posting `on_deadly_signal` onto
	/// `queue` whenever one arrives and reject-deadly is not armed.
	#[must_use]
	pub fn spawn<F>(queue: Arc<ChildQueue>, on_deadly_signal: F) -> Self
	where
		F: Fn() + Send + Sync + 'static,
	{
		// SAFETY: sets a single global disposition at startup; no other
		// signal-handling code in this process touches SIGPIPE.
		unsafe {
			libc::signal(libc::SIGPIPE, libc::SIG_IGN);
		}

		let reject_deadly = Arc::new(AtomicBool::new(false));
		let on_deadly_signal = Arc::new(on_deadly_signal);

		for (name, kind) in deadly_signals() {
			let Ok(mut stream) = signal(kind) else {
				warn!(signal = name, "failed to install signal handler");
				continue;
			};
			let reject_deadly = reject_deadly.clone();
			let cb = on_deadly_signal.clone();
			let queue = queue.clone();
			tokio::spawn(async move {
				loop {
					if stream.recv().await.is_none() {
						return;
					}
					if reject_deadly.load(Ordering::SeqCst) {
						debug!(signal = name, "reject-deadly armed, dropping signal");
						continue;
					}
					let cb = cb.clone();
					queue.push_fn(move || cb());
				}
			});
		}

		Self { reject_deadly }
	}

	/// Arm reject-deadly: deadly signals arriving while armed are dropped
	/// instead of invoking the preserve-and-exit callback.
	pub fn arm_reject_deadly(&self) {
		self.reject_deadly.store(true, Ordering::SeqCst);
	}

	/// Disarm reject-deadly, resuming normal preserve-and-exit delivery.
	pub fn disarm_reject_deadly(&self) {
		self.reject_deadly.store(false, Ordering::SeqCst);
	}

	pub fn is_reject_deadly_armed(&self) -> bool {
		self.reject_deadly.load(Ordering::SeqCst)
	}
}

fn deadly_signals() -> Vec<(&'static str, SignalKind)> {
	let mut kinds = vec![
		("SIGHUP", SignalKind::hangup()),
		("SIGTERM", SignalKind::terminate()),
		("SIGQUIT", SignalKind::quit()),
	];
	#[cfg(target_os = "linux")]
	kinds.push(("SIGPWR", SignalKind::from_raw(libc::SIGPWR)));
	kinds
}
