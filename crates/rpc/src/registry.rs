//! Process-wide method table: name → handler. Grounded on the same shape as
//! `BrokerService::call` (`crates/broker/broker/src/service.rs`), generalized
//! from "one big match over a fixed `RequestPayload` enum" to a runtime map
//! so an embedder can register handlers for whatever methods it exposes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::value::Value;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send>>;

trait ErasedHandler: Send + Sync {
	fn call(&self, args: Vec<Value>) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> ErasedHandler for FnHandler<F>
where
	F: Fn(Vec<Value>) -> Fut + Send + Sync,
	Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
	fn call(&self, args: Vec<Value>) -> HandlerFuture {
		Box::pin((self.0)(args))
	}
}

/// A registry of named method handlers, shared read-only across every
/// channel once built.
#[derive(Default, Clone)]
pub struct MethodRegistry {
	handlers: Arc<HashMap<String, Box<dyn ErasedHandler>>>,
}

/// Builder for a [`MethodRegistry`]; handlers cannot be added once built
/// since the registry is shared (via `Arc`) across every channel that uses
/// it.
#[derive(Default)]
pub struct MethodRegistryBuilder {
	handlers: HashMap<String, Box<dyn ErasedHandler>>,
}

impl MethodRegistryBuilder {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, Value>> + Send + 'static,
	{
		self.handlers.insert(name.into(), Box::new(FnHandler(handler)));
		self
	}

	#[must_use]
	pub fn build(self) -> MethodRegistry {
		MethodRegistry {
			handlers: Arc::new(self.handlers),
		}
	}
}

impl MethodRegistry {
	#[must_use]
	pub fn builder() -> MethodRegistryBuilder {
		MethodRegistryBuilder::new()
	}

	pub fn contains(&self, method: &str) -> bool {
		self.handlers.contains_key(method)
	}

	/// Dispatch `method`. Returns `None` if no handler is registered, which
	/// the caller turns into an error response rather than panicking.
	pub fn dispatch(&self, method: &str, args: Vec<Value>) -> Option<HandlerFuture> {
		self.handlers.get(method).map(|h| h.call(args))
	}
}
