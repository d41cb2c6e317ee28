//! Binary request/response/notification framing over any `xeno_io` handle,
//! with a pluggable method registry, per-channel subscriptions, and
//! synchronous call semantics built on top of `xeno_queue`'s focus-poll.
//!
//! Wire format: a 4-byte little-endian length prefix followed by a
//! postcard-encoded [`Frame`], matching
//! `crates/broker/proto/src/protocol.rs`'s `BrokerProtocol` exactly, except
//! generalized from one hardcoded application protocol to a named-method
//! dispatch table any embedder can populate.

mod channel;
mod error;
mod frame;
mod registry;
mod value;

pub use channel::{Channel, ChannelRegistry, PendingCall};
pub use error::RpcError;
pub use frame::{read_frame, write_frame, Frame, FrameDecoder, Notification, Request, RequestId, Response, MAX_FRAME_BYTES};
pub use registry::{MethodRegistry, MethodRegistryBuilder};
pub use value::Value;

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};
	use xeno_queue::Queue;

	// Every test here blocks the calling task on `ChildQueue`/`Queue::poll`
	// (a real OS-level Condvar wait) while relying on separately spawned
	// stream tasks to make progress; that only happens with real worker
	// threads (see DESIGN.md).
	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn call_roundtrips_through_a_registered_method() {
		let parent = Queue::new();

		let registry = MethodRegistry::builder()
			.register("double", |args: Vec<Value>| async move {
				let Some(Value::Int(n)) = args.into_iter().next() else {
					return Err(Value::Str("expected one int arg".into()));
				};
				Ok(Value::Int(n * 2))
			})
			.build();

		let (client_io, server_io) = tokio::io::duplex(4096);
		let (client_r, client_w) = tokio::io::split(client_io);
		let (server_r, server_w) = tokio::io::split(server_io);

		let client = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(client_r), Box::pin(client_w), 0);
		let _server = Channel::bind(2, &parent, registry, Box::pin(server_r), Box::pin(server_w), 0);

		let result = client.call("double", vec![Value::Int(21)], 1000).unwrap();
		assert_eq!(result, Value::Int(42));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn call_against_unknown_method_resolves_with_remote_error() {
		let parent = Queue::new();
		let (client_io, server_io) = tokio::io::duplex(4096);
		let (client_r, client_w) = tokio::io::split(client_io);
		let (server_r, server_w) = tokio::io::split(server_io);

		let client = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(client_r), Box::pin(client_w), 0);
		let _server = Channel::bind(2, &parent, MethodRegistry::default(), Box::pin(server_r), Box::pin(server_w), 0);

		let err = client.call("missing", vec![], 1000).unwrap_err();
		assert!(matches!(err, RpcError::Remote(_)));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn notification_is_delivered_only_when_subscribed() {
		let parent = Queue::new();
		let (client_io, server_io) = tokio::io::duplex(4096);
		let (client_r, client_w) = tokio::io::split(client_io);
		let (server_r, server_w) = tokio::io::split(server_io);

		let client = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(client_r), Box::pin(client_w), 0);
		let server = Channel::bind(2, &parent, MethodRegistry::default(), Box::pin(server_r), Box::pin(server_w), 0);

		let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
		{
			let received = received.clone();
			client.set_notify_handler(move |notif| received.lock().unwrap().push(notif.method));
		}
		client.subscribe("tick");

		server.notify("tick", vec![]).unwrap();
		server.notify("unsubscribed-event", vec![]).unwrap();

		let mut budget = 50;
		loop {
			if let Some(event) = parent.poll(20) {
				event.invoke();
			}
			if !received.lock().unwrap().is_empty() || budget == 0 {
				break;
			}
			budget -= 1;
		}

		assert_eq!(received.lock().unwrap().as_slice(), ["tick"]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn closing_the_transport_resolves_pending_calls_with_an_error() {
		let parent = Queue::new();
		let (client_io, server_io) = tokio::io::duplex(4096);
		drop(server_io);
		let (client_r, client_w) = tokio::io::split(client_io);

		let client = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(client_r), Box::pin(client_w), 0);
		let err = client.call("anything", vec![], 1000).unwrap_err();
		assert!(matches!(err, RpcError::Closed));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn broadcast_skips_closed_and_unsubscribed_channels() {
		let parent = Queue::new();
		let (a_io, a_peer) = tokio::io::duplex(4096);
		let (a_peer_r, a_peer_w) = tokio::io::split(a_peer);
		let (a_r, a_w) = tokio::io::split(a_io);

		let (b_io, b_peer) = tokio::io::duplex(4096);
		drop(b_peer);
		let (b_r, b_w) = tokio::io::split(b_io);

		// `subscriber` is the registry-held end of the connection: its own
		// subscription set stands in for "my peer asked to subscribe to
		// tick", which is what `ChannelRegistry::broadcast` consults before
		// sending. `subscriber_peer` is the far end that actually receives
		// the notify frame; its own subscription set gates whether its
		// notify handler fires on the decoded frame, same as any other
		// channel receiving a notification.
		let subscriber = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(a_r), Box::pin(a_w), 0);
		let subscriber_peer = Channel::bind(11, &parent, MethodRegistry::default(), Box::pin(a_peer_r), Box::pin(a_peer_w), 0);
		// Bound with no live peer on the other end: its reader stream observes
		// EOF almost immediately and marks it closed, which the registry must
		// notice and skip rather than erroring the whole broadcast.
		let closing = Channel::bind(2, &parent, MethodRegistry::default(), Box::pin(b_r), Box::pin(b_w), 0);

		let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
		{
			let received = received.clone();
			subscriber_peer.set_notify_handler(move |notif| received.lock().unwrap().push(notif.method));
		}
		subscriber_peer.subscribe("tick");
		subscriber.subscribe("tick");

		let registry = ChannelRegistry::new();
		registry.register(subscriber.clone());
		registry.register(closing.clone());

		// Give the unpeered channel's reader stream a chance to observe EOF
		// and mark itself closed before broadcasting.
		let mut budget = 50;
		while budget > 0 && !closing.is_closed() {
			if let Some(event) = parent.poll(20) {
				event.invoke();
			}
			budget -= 1;
		}
		assert!(closing.is_closed());

		registry.broadcast("tick", vec![]);
		assert_eq!(registry.len(), 1, "the closed channel should have been evicted");

		let mut budget = 50;
		loop {
			if let Some(event) = parent.poll(20) {
				event.invoke();
			}
			if !received.lock().unwrap().is_empty() || budget == 0 {
				break;
			}
			budget -= 1;
		}
		assert_eq!(received.lock().unwrap().as_slice(), ["tick"]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn call_recomputes_remaining_timeout_across_intervening_events() {
		let parent = Queue::new();
		let (client_io, server_io) = tokio::io::duplex(4096);
		let (client_r, client_w) = tokio::io::split(client_io);
		let (server_r, server_w) = tokio::io::split(server_io);

		let registry = MethodRegistry::builder()
			.register("never", |_: Vec<Value>| async move {
				tokio::time::sleep(std::time::Duration::from_secs(10)).await;
				Ok(Value::Nil)
			})
			.build();

		let client = Channel::bind(1, &parent, MethodRegistry::default(), Box::pin(client_r), Box::pin(client_w), 0);
		let server = Channel::bind(2, &parent, registry, Box::pin(server_r), Box::pin(server_w), 0);

		// Three unrelated notifications land on the client's dispatch queue
		// and get invoked while the call below is still waiting, but none of
		// them ever answers it. If the call's wait re-passed the original
		// 80ms budget to every inner poll instead of recomputing it against
		// a fixed deadline, each invoked event would restart the clock and
		// the call would not time out until well past 80ms + 90ms.
		for delay_ms in [30u64, 60, 90] {
			let server = server.clone();
			tokio::spawn(async move {
				tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
				let _ = server.notify("tick", vec![]);
			});
		}

		let started = std::time::Instant::now();
		let err = client.call("never", vec![], 80).unwrap_err();
		assert!(matches!(err, RpcError::Timeout));
		assert!(
			started.elapsed() < std::time::Duration::from_millis(150),
			"timeout should fire around the original 80ms budget, not be reset by each intervening event"
		);
	}
}
