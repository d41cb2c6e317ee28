use crate::value::Value;

/// Errors surfaced by the RPC channel layer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("frame decode error: {0}")]
	Decode(String),

	#[error("frame exceeds maximum size ({0} bytes)")]
	FrameTooLarge(usize),

	#[error("incoming buffer is full; decoder fell behind the reactor")]
	DecoderBackpressure,

	#[error("unknown method: {0}")]
	MethodNotFound(String),

	#[error("channel closed")]
	Closed,

	#[error("call timed out")]
	Timeout,

	#[error("remote error: {0:?}")]
	Remote(Value),
}
