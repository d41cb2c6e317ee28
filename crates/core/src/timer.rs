//! A single-shot deferred timer: schedule a posted event on a child queue
//! after a delay, cancellable before it fires. Generalizes the
//! spawn-a-sleep-then-check-a-flag idiom `xeno_process::Process::stop` uses
//! for its own kill escalation, for anything in the facade that needs a
//! one-off delayed event without pulling in a full timer wheel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xeno_queue::ChildQueue;

pub struct Timer {
	cancelled: Arc<AtomicBool>,
}

impl Timer {
	/// Schedule `cb` to run as a posted event on `queue` after `delay`
	/// unless [`Timer::cancel`] is called first.
	#[must_use]
	pub fn after<F>(queue: Arc<ChildQueue>, delay: Duration, cb: F) -> Self
	where
		F: FnOnce() + Send + 'static,
	{
		let cancelled = Arc::new(AtomicBool::new(false));
		let flag = cancelled.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if flag.load(Ordering::SeqCst) {
				return;
			}
			queue.push_fn(cb);
		});
		Self { cancelled }
	}

	/// Prevent the timer from firing, if it hasn't already. A timer whose
	/// delay has already elapsed and whose event is already queued cannot be
	/// recalled; this only stops it from ever being posted in the first
	/// place.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;
	use xeno_queue::Queue;

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn fires_after_delay() {
		let parent = Queue::new();
		let child = Arc::new(parent.new_child());
		let fired = Arc::new(Mutex::new(false));
		{
			let fired = fired.clone();
			let _timer = Timer::after(child, Duration::from_millis(10), move || {
				*fired.lock().unwrap() = true;
			});
			let mut budget = 100;
			loop {
				if let Some(event) = parent.poll(20) {
					event.invoke();
				}
				if *fired.lock().unwrap() || budget == 0 {
					break;
				}
				budget -= 1;
			}
		}
		assert!(*fired.lock().unwrap());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn cancel_before_delay_suppresses_the_event() {
		let parent = Queue::new();
		let child = Arc::new(parent.new_child());
		let fired = Arc::new(Mutex::new(false));
		let timer = {
			let fired = fired.clone();
			Timer::after(child, Duration::from_millis(30), move || {
				*fired.lock().unwrap() = true;
			})
		};
		timer.cancel();
		tokio::time::sleep(Duration::from_millis(60)).await;
		while parent.poll(10).map(|e| e.invoke()).is_some() {}
		assert!(!*fired.lock().unwrap());
	}
}
