//! Unified I/O handle abstraction over pipes, TTYs, regular files, and
//! sockets. Every concrete handle reduces to a readable half, a writable
//! half, or both, so the stream types above only ever deal in boxed
//! `AsyncRead`/`AsyncWrite` trait objects.

use std::io;
use std::path::Path;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A handle capable of producing its readable half, its writable half, or
/// both. Object-safe so the loop driver can hold a heterogeneous collection
/// of bound streams without naming their concrete transport.
pub trait IoHandle: Send {
	/// Consume the handle, yielding whichever halves it supports. A
	/// pipe yields exactly one side; a TTY, file, or socket yields both.
	fn split(self: Box<Self>) -> (Option<BoxedReader>, Option<BoxedWriter>);
}

struct ReadOnly<R>(R);
impl<R: AsyncRead + Send + 'static> IoHandle for ReadOnly<R> {
	fn split(self: Box<Self>) -> (Option<BoxedReader>, Option<BoxedWriter>) {
		(Some(Box::pin(self.0)), None)
	}
}

struct WriteOnly<W>(W);
impl<W: AsyncWrite + Send + 'static> IoHandle for WriteOnly<W> {
	fn split(self: Box<Self>) -> (Option<BoxedReader>, Option<BoxedWriter>) {
		(None, Some(Box::pin(self.0)))
	}
}

struct Duplex<S>(S);
impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoHandle for Duplex<S> {
	fn split(self: Box<Self>) -> (Option<BoxedReader>, Option<BoxedWriter>) {
		let (r, w) = tokio::io::split(self.0);
		(Some(Box::pin(r)), Some(Box::pin(w)))
	}
}

/// The write half of a spawned child's stdin.
pub fn child_stdin(stdin: ChildStdin) -> Box<dyn IoHandle> {
	Box::new(WriteOnly(stdin))
}

/// The read half of a spawned child's stdout.
pub fn child_stdout(stdout: ChildStdout) -> Box<dyn IoHandle> {
	Box::new(ReadOnly(stdout))
}

/// The read half of a spawned child's stderr.
pub fn child_stderr(stderr: ChildStderr) -> Box<dyn IoHandle> {
	Box::new(ReadOnly(stderr))
}

/// Open a TTY device for bidirectional use (used for the controlling
/// terminal fallback described in the external-interfaces contract: stdin on
/// fd 0, falling back to fd 2 when fd 0 is not a TTY but fd 2 is).
pub async fn tty(path: &Path) -> io::Result<Box<dyn IoHandle>> {
	let file = tokio::fs::OpenOptions::new()
		.read(true)
		.write(true)
		.open(path)
		.await?;
	Ok(Box::new(Duplex(file)))
}

/// Open a regular file. Reads against `tokio::fs::File` already dispatch
/// through the blocking thread pool per call, which is what gives us the
/// "cooperative chunked read" the reactor needs without a dedicated polling
/// timer: every `poll_read` completes as its own bounded unit of blocking
/// work rather than stalling the reactor thread.
pub async fn regular_file(path: &Path) -> io::Result<Box<dyn IoHandle>> {
	let file = tokio::fs::File::open(path).await?;
	Ok(Box::new(Duplex(file)))
}

pub fn tcp_stream(stream: TcpStream) -> Box<dyn IoHandle> {
	Box::new(Duplex(stream))
}

pub fn unix_stream(stream: UnixStream) -> Box<dyn IoHandle> {
	Box::new(Duplex(stream))
}
