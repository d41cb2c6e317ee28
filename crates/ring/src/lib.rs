//! Fixed-capacity circular byte buffer.
//!
//! [`RingBuffer`] is the storage primitive behind every streaming I/O path in
//! the event core: producers obtain a raw writable region and hand its
//! pointer straight to an OS read call, consumers obtain a raw readable
//! region and hand it to an OS write call. No byte is ever relocated.
//!
//! # Mental model
//!
//! - Capacity `C`, read pointer `R`, write pointer `W`, fill count `S <= C`.
//! - The readable window is the contiguous prefix starting at `R`, wrapping
//!   at `C` when it would run past the end of the backing storage.
//! - `on_full` fires exactly on the transition `S < C -> S == C`.
//! - `on_nonfull` fires exactly on the transition `S == C -> S < C`.
//!
//! # Invariants
//!
//! 1. `R` and `W` are always in `[0, C)`.
//! 2. `S` always equals the number of unread bytes.

use std::collections::VecDeque;

/// A region of contiguous bytes available for reading or writing, bounded at
/// the nearer of the storage wrap point or the opposing cursor.
#[derive(Debug)]
pub struct Region<'a> {
	slice: &'a mut [u8],
}

impl<'a> Region<'a> {
	/// Raw bytes of the region. Empty when the buffer is full (write region)
	/// or empty (read region).
	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		self.slice
	}

	/// Raw bytes of the region (read-only view).
	pub fn as_slice(&self) -> &[u8] {
		self.slice
	}

	/// Number of bytes available in this region.
	pub fn len(&self) -> usize {
		self.slice.len()
	}

	/// True if the region is empty (buffer full or empty, respectively).
	pub fn is_empty(&self) -> bool {
		self.slice.is_empty()
	}
}

/// Fixed-capacity circular byte buffer with fullness callbacks.
///
/// Single-threaded: a `RingBuffer` is owned by exactly one stream and is
/// never shared across threads (see the event core's concurrency model).
pub struct RingBuffer {
	storage: Vec<u8>,
	read: usize,
	write: usize,
	size: usize,
	on_full: Option<Box<dyn FnMut() + Send>>,
	on_nonfull: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for RingBuffer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RingBuffer")
			.field("capacity", &self.capacity())
			.field("read", &self.read)
			.field("write", &self.write)
			.field("size", &self.size)
			.finish()
	}
}

impl RingBuffer {
	/// Default capacity used when callers don't have a specific size in mind
	/// (matches the legacy default of 64 KiB minus one).
	pub const DEFAULT_CAPACITY: usize = 0xffff;

	/// Create a new ring buffer with the given capacity. A capacity of zero
	/// falls back to [`Self::DEFAULT_CAPACITY`].
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let capacity = if capacity == 0 {
			Self::DEFAULT_CAPACITY
		} else {
			capacity
		};
		Self {
			storage: vec![0u8; capacity],
			read: 0,
			write: 0,
			size: 0,
			on_full: None,
			on_nonfull: None,
		}
	}

	/// Register the callback fired on the `S < C -> S == C` transition.
	pub fn set_on_full<F: FnMut() + Send + 'static>(&mut self, cb: F) {
		self.on_full = Some(Box::new(cb));
	}

	/// Register the callback fired on the `S == C -> S < C` transition.
	pub fn set_on_nonfull<F: FnMut() + Send + 'static>(&mut self, cb: F) {
		self.on_nonfull = Some(Box::new(cb));
	}

	/// Total capacity `C`.
	pub fn capacity(&self) -> usize {
		self.storage.len()
	}

	/// Current fill count `S`.
	pub fn len(&self) -> usize {
		self.size
	}

	/// Free space, `C - S`.
	pub fn space(&self) -> usize {
		self.capacity() - self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	pub fn is_full(&self) -> bool {
		self.size == self.capacity()
	}

	/// The largest contiguous writable region from `W` to the nearer of the
	/// wrap point or `R`. Empty when full.
	pub fn write_region(&mut self) -> Region<'_> {
		let cap = self.capacity();
		let count = if self.write >= self.read {
			cap - self.write
		} else {
			self.read - self.write
		};
		Region {
			slice: &mut self.storage[self.write..self.write + count],
		}
	}

	/// Advance the write cursor by `n` bytes previously written into the
	/// slice returned by [`Self::write_region`]. Fires `on_full` exactly at
	/// the `S < C -> S == C` transition.
	pub fn commit_write(&mut self, n: usize) {
		if n == 0 {
			return;
		}
		debug_assert!(self.size + n <= self.capacity());
		let was_full = self.is_full();
		self.write += n;
		if self.write == self.capacity() {
			self.write = 0;
		}
		self.size += n;
		if !was_full && self.is_full() {
			if let Some(cb) = self.on_full.as_mut() {
				cb();
			}
		}
	}

	/// The largest contiguous readable region starting at `R`. Empty when
	/// the buffer is empty.
	pub fn read_region(&mut self) -> Region<'_> {
		let count = if self.size == 0 {
			0
		} else if self.read < self.write {
			self.write - self.read
		} else {
			self.capacity() - self.read
		};
		Region {
			slice: &mut self.storage[self.read..self.read + count],
		}
	}

	/// Advance the read cursor by `n` bytes previously consumed from the
	/// slice returned by [`Self::read_region`]. Fires `on_nonfull` exactly at
	/// the `S == C -> S < C` transition.
	pub fn commit_read(&mut self, n: usize) {
		if n == 0 {
			return;
		}
		debug_assert!(n <= self.size);
		let was_full = self.is_full();
		self.read += n;
		if self.read == self.capacity() {
			self.read = 0;
		}
		self.size -= n;
		if was_full && !self.is_full() {
			if let Some(cb) = self.on_nonfull.as_mut() {
				cb();
			}
		}
	}

	/// Copy as much of `src` into the buffer as fits, looping over write
	/// regions to handle wrap. Returns the number of bytes actually copied.
	pub fn write(&mut self, mut src: &[u8]) -> usize {
		let total = src.len();
		loop {
			if src.is_empty() {
				break;
			}
			let mut region = self.write_region();
			if region.is_empty() {
				break;
			}
			let n = region.len().min(src.len());
			region.as_mut_slice()[..n].copy_from_slice(&src[..n]);
			self.commit_write(n);
			src = &src[n..];
		}
		total - src.len()
	}

	/// Copy as much of the buffer into `dst` as fits, looping over read
	/// regions to handle wrap. Returns the number of bytes actually copied.
	pub fn read(&mut self, dst: &mut [u8]) -> usize {
		let mut written = 0;
		loop {
			if written == dst.len() {
				break;
			}
			let region = self.read_region();
			if region.is_empty() {
				break;
			}
			let n = region.len().min(dst.len() - written);
			dst[written..written + n].copy_from_slice(&region.as_slice()[..n]);
			self.commit_read(n);
			written += n;
		}
		written
	}

	/// Drain the entire contents into a freshly allocated `Vec<u8>`. Used by
	/// consumers (e.g. the RPC frame decoder) that want an owned,
	/// non-wrapping copy of everything currently buffered.
	pub fn drain_to_vec(&mut self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.len());
		let mut remaining = self.len();
		while remaining > 0 {
			let region = self.read_region();
			out.extend_from_slice(region.as_slice());
			let n = region.len();
			self.commit_read(n);
			remaining -= n;
		}
		out
	}

	/// Peek at the readable bytes in order without consuming them, useful in
	/// tests and for frame-boundary scanning.
	pub fn peek_to_vec_deque(&self) -> VecDeque<u8> {
		let mut out = VecDeque::with_capacity(self.len());
		let mut read = self.read;
		let mut remaining = self.len();
		while remaining > 0 {
			out.push_back(self.storage[read]);
			read = (read + 1) % self.capacity();
			remaining -= 1;
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn write_read_roundtrip() {
		let mut buf = RingBuffer::new(16);
		let n = buf.write(b"hello world");
		assert_eq!(n, 11);
		let mut out = [0u8; 11];
		let n = buf.read(&mut out);
		assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
	}

	#[test]
	fn on_full_fires_exactly_at_transition() {
		let full_count = Arc::new(AtomicUsize::new(0));
		let fc = full_count.clone();
		let mut buf = RingBuffer::new(8);
		buf.set_on_full(move || {
			fc.fetch_add(1, Ordering::SeqCst);
		});
		buf.write(b"ABCDEFG"); // 7 bytes, not full yet
		assert_eq!(full_count.load(Ordering::SeqCst), 0);
		buf.write(b"H"); // 8th byte, transitions to full
		assert_eq!(full_count.load(Ordering::SeqCst), 1);
		// writing further (no space) must not refire
		buf.write(b"I");
		assert_eq!(full_count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn backpressure_scenario_from_spec() {
		// Ring buffer capacity = 8; push "ABCDEFGH" -> on_full fires once.
		// Consume 3 bytes -> on_nonfull fires once. Fill count after = 5;
		// readable bytes in order are "DEFGH".
		let full_count = Arc::new(AtomicUsize::new(0));
		let nonfull_count = Arc::new(AtomicUsize::new(0));
		let mut buf = RingBuffer::new(8);
		{
			let fc = full_count.clone();
			buf.set_on_full(move || {
				fc.fetch_add(1, Ordering::SeqCst);
			});
		}
		{
			let nc = nonfull_count.clone();
			buf.set_on_nonfull(move || {
				nc.fetch_add(1, Ordering::SeqCst);
			});
		}
		buf.write(b"ABCDEFGH");
		assert_eq!(full_count.load(Ordering::SeqCst), 1);

		let mut consumed = [0u8; 3];
		buf.read(&mut consumed);
		assert_eq!(nonfull_count.load(Ordering::SeqCst), 1);
		assert_eq!(buf.len(), 5);

		let mut rest = [0u8; 5];
		buf.read(&mut rest);
		assert_eq!(&rest, b"DEFGH");
	}

	#[test]
	fn capacity_one_makes_progress_on_wrap() {
		let mut buf = RingBuffer::new(1);
		for byte in b"abc" {
			let n = buf.write(&[*byte]);
			assert_eq!(n, 1);
			let mut out = [0u8; 1];
			let n = buf.read(&mut out);
			assert_eq!(n, 1);
			assert_eq!(out[0], *byte);
		}
	}

	#[test]
	fn write_region_empty_when_full() {
		let mut buf = RingBuffer::new(4);
		buf.write(b"abcd");
		assert!(buf.write_region().is_empty());
	}

	#[test]
	fn partial_write_when_space_limited() {
		let mut buf = RingBuffer::new(4);
		let n = buf.write(b"abcdef");
		assert_eq!(n, 4);
		assert!(buf.is_full());
	}

	#[test]
	fn wrap_preserves_order_across_many_cycles() {
		let mut buf = RingBuffer::new(4);
		let mut expected = 0u8;
		let mut produced = 0u8;
		for _ in 0..100 {
			buf.write(&[produced]);
			produced = produced.wrapping_add(1);
			let mut out = [0u8; 1];
			buf.read(&mut out);
			assert_eq!(out[0], expected);
			expected = expected.wrapping_add(1);
		}
	}
}
