/// Errors surfaced by I/O handles and the streams built on top of them.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("handle already closed")]
	Closed,

	#[error("stream is not bound to a handle")]
	Unbound,
}
