//! Self-describing argument/result value, the generic stand-in for whatever
//! application-specific request/response payload a concrete protocol would
//! otherwise hand-roll (c.f. `crates/broker/proto/src/types.rs` in the
//! teacher, which plays the same role for the broker's own IPC frame).

use serde::{Deserialize, Serialize};

/// A method argument, result, or error payload. Array/Map recurse, matching
/// a msgpack-rpc style "ordered tuple of self-describing values" wire model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Nil,
	Bool(bool),
	Int(i64),
	Uint(u64),
	Float(f64),
	Str(String),
	Bin(Vec<u8>),
	Array(Vec<Value>),
	Map(Vec<(Value, Value)>),
}

impl From<()> for Value {
	fn from(_: ()) -> Self {
		Value::Nil
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<u64> for Value {
	fn from(v: u64) -> Self {
		Value::Uint(v)
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Str(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Str(v.to_owned())
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Value::Bin(v)
	}
}
