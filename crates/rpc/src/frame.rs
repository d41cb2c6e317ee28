//! Wire frame model and length-prefixed postcard codec.
//!
//! Every message is `[discriminator, ...]` at the encoding level (postcard's
//! own enum-variant tag stands in for the C ancestor's leading integer), read
//! and written exactly as `crates/broker/proto/src/protocol.rs` does for its
//! own `IpcFrame`: a 4-byte little-endian length prefix followed by a
//! postcard-encoded payload, both bounded by the same sanity ceiling.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xeno_ring::RingBuffer;

use crate::error::RpcError;
use crate::value::Value;

/// Monotonic id assigned by the caller when it issues a request; echoed back
/// on the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	pub id: RequestId,
	pub method: String,
	pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub id: RequestId,
	pub result: Option<Value>,
	pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
	pub method: String,
	pub args: Vec<Value>,
}

/// The one type that ever crosses the wire. `[0]` request, `[1]` response,
/// `[2]` notification, matching §6's "ordered arrays with a leading integer
/// discriminator" at the semantic level; postcard supplies the discriminator
/// itself rather than us packing one by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
	Request(Request),
	Response(Response),
	Notification(Notification),
}

/// Maximum encoded frame size accepted on either side of the wire, matching
/// the teacher's own 16 MiB sanity ceiling.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub async fn read_frame(input: &mut (impl AsyncBufRead + Unpin + Send)) -> Result<Frame, RpcError> {
	let mut len_bytes = [0u8; 4];
	input.read_exact(&mut len_bytes).await?;
	let len = u32::from_le_bytes(len_bytes) as usize;
	if len > MAX_FRAME_BYTES {
		return Err(RpcError::FrameTooLarge(len));
	}
	let mut buf = vec![0u8; len];
	input.read_exact(&mut buf).await?;
	postcard::from_bytes(&buf).map_err(|e| RpcError::Decode(e.to_string()))
}

pub async fn write_frame(output: &mut (impl AsyncWrite + Unpin + Send), frame: &Frame) -> Result<(), RpcError> {
	let buf = postcard::to_allocvec(frame).map_err(|e| RpcError::Decode(e.to_string()))?;
	if buf.len() > MAX_FRAME_BYTES {
		return Err(RpcError::FrameTooLarge(buf.len()));
	}
	output.write_all(&(buf.len() as u32).to_le_bytes()).await?;
	output.write_all(&buf).await?;
	output.flush().await?;
	Ok(())
}

/// Incremental frame decoder over a fixed-capacity ring buffer: bytes arrive
/// in arbitrary chunks from the reactor and accumulate here; `drain_frames`
/// repeatedly attempts to parse a complete length-prefixed frame out of
/// whatever has accumulated so far, same shape as `BrokerProtocol::read_message`
/// but operating on buffered bytes instead of an `AsyncBufRead`.
pub struct FrameDecoder {
	ring: RingBuffer,
}

impl FrameDecoder {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			ring: RingBuffer::new(capacity),
		}
	}

	/// Copy newly read bytes into the decode buffer.
	pub fn feed(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
		let n = self.ring.write(bytes);
		if n < bytes.len() {
			return Err(RpcError::DecoderBackpressure);
		}
		Ok(())
	}

	/// Parse every complete frame currently buffered, leaving any trailing
	/// partial frame in place for the next `feed`.
	pub fn drain_frames(&mut self) -> Result<Vec<Frame>, RpcError> {
		let mut out = Vec::new();
		loop {
			if self.ring.len() < 4 {
				break;
			}
			let prefix = self.ring.peek_to_vec_deque();
			let len_bytes: Vec<u8> = prefix.into_iter().take(4).collect();
			let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
			if len > MAX_FRAME_BYTES {
				return Err(RpcError::FrameTooLarge(len));
			}
			if self.ring.len() < 4 + len {
				break;
			}
			let mut discard = [0u8; 4];
			self.ring.read(&mut discard);
			let mut payload = vec![0u8; len];
			self.ring.read(&mut payload);
			let frame = postcard::from_bytes(&payload).map_err(|e| RpcError::Decode(e.to_string()))?;
			out.push(frame);
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn write_then_read_frame_roundtrips() {
		let request = Frame::Request(Request {
			id: RequestId(1),
			method: "ping".into(),
			args: vec![Value::Int(7)],
		});
		let mut buf = Vec::new();
		write_frame(&mut buf, &request).await.unwrap();

		let mut reader = tokio::io::BufReader::new(&buf[..]);
		let decoded = read_frame(&mut reader).await.unwrap();
		assert_eq!(decoded, request);
	}

	#[test]
	fn decoder_parses_frame_split_across_feeds() {
		let request = Frame::Notification(Notification {
			method: "tick".into(),
			args: vec![],
		});
		let payload = postcard::to_allocvec(&request).unwrap();
		let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
		wire.extend_from_slice(&payload);

		let mut decoder = FrameDecoder::new(64);
		let (first, second) = wire.split_at(3);
		decoder.feed(first).unwrap();
		assert!(decoder.drain_frames().unwrap().is_empty());
		decoder.feed(second).unwrap();
		let frames = decoder.drain_frames().unwrap();
		assert_eq!(frames, vec![request]);
	}

	#[test]
	fn decoder_rejects_oversized_frame() {
		let mut decoder = FrameDecoder::new(64);
		let huge_len = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
		decoder.feed(&huge_len).unwrap();
		assert!(matches!(decoder.drain_frames(), Err(RpcError::FrameTooLarge(_))));
	}
}
