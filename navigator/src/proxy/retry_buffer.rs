//! Response buffering that keeps retries possible.
//!
//! Nothing reaches the client while a response still fits in the buffer, so
//! a transport error mid-body can throw the attempt away and try again. The
//! moment a chunk would push past the cap, everything buffered so far is
//! flushed ahead of that chunk and the attempt switches to pass-through;
//! from then on a retry would duplicate bytes, so retrying is off. The
//! flush-before-flag ordering is what keeps large responses untruncated.

use bytes::{Bytes, BytesMut};

#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    /// Chunk absorbed; the attempt can still be retried.
    Buffered,
    /// Cap exceeded: `prefix` is everything accumulated (the buffer then the
    /// offending chunk, in order) and must go straight to the client.
    Overflow { prefix: Bytes },
}

#[derive(Debug)]
pub struct RetryBuffer {
    max: usize,
    buf: BytesMut,
    limit_hit: bool,
}

impl RetryBuffer {
    pub fn new(max: usize) -> Self {
        RetryBuffer {
            max,
            buf: BytesMut::new(),
            limit_hit: false,
        }
    }

    pub fn limit_hit(&self) -> bool {
        self.limit_hit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Absorb one body chunk, or report the overflow that ends buffering.
    /// A chunk landing exactly on the cap still buffers.
    pub fn push(&mut self, chunk: Bytes) -> Push {
        debug_assert!(!self.limit_hit, "push after overflow");
        if self.buf.len() + chunk.len() <= self.max {
            self.buf.extend_from_slice(&chunk);
            return Push::Buffered;
        }
        // Flush-then-flag: the buffered prefix leaves first, then the chunk
        // that broke the cap.
        self.buf.extend_from_slice(&chunk);
        self.limit_hit = true;
        Push::Overflow {
            prefix: self.buf.split().freeze(),
        }
    }

    /// Discard the attempt (used between retries).
    pub fn reset(&mut self) {
        debug_assert!(!self.limit_hit, "reset after overflow");
        self.buf.clear();
    }

    /// The complete, in-cap response body.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}
