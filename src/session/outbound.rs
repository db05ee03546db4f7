//! Outbound buffering for the CLI session manager.
//!
//! Two bounded buffers keep a slow or absent transport from blocking the
//! PTY reader:
//!
//! - [`OutboundQueue`] holds sealed envelopes awaiting transmission. When
//!   full, the oldest terminal-output envelope is dropped (the relay cache
//!   covers short gaps on rejoin); control-carrying envelopes survive.
//! - [`ReplayBuffer`] holds recent *plaintext* PTY output. When a web peer
//!   joins with a fresh key, relay-cached ciphertext is useless to it, so
//!   the manager re-encrypts this buffer under the new shared key instead.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use crate::constants::OUTBOUND_QUEUE_CAPACITY;
use crate::protocol::{Envelope, MessageKind};

/// Plaintext replay capacity: 256 KiB of recent PTY output.
pub const REPLAY_BUFFER_CAPACITY: usize = 256 * 1024;

/// One envelope queued for transmission.
#[derive(Debug)]
struct QueuedEnvelope {
    envelope: Envelope,
    kind: MessageKind,
}

/// Bounded queue of sealed envelopes, drop-oldest-output on overflow.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<QueuedEnvelope>,
    dropped: u64,
}

impl OutboundQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an envelope, evicting the oldest terminal output if full.
    pub fn push(&mut self, envelope: Envelope, kind: MessageKind) {
        if self.queue.len() >= OUTBOUND_QUEUE_CAPACITY {
            let victim = self
                .queue
                .iter()
                .position(|q| q.kind == MessageKind::TerminalOutput);
            match victim {
                Some(idx) => {
                    self.queue.remove(idx);
                }
                None => {
                    self.queue.pop_front();
                }
            }
            self.dropped += 1;
            log::warn!(
                "Outbound queue full, dropped oldest envelope ({} dropped total)",
                self.dropped
            );
        }
        self.queue.push_back(QueuedEnvelope { envelope, kind });
    }

    /// Take the next envelope to send.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front().map(|q| q.envelope)
    }

    /// Discard everything (used on close).
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of queued envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Fixed-capacity ring of recent plaintext PTY output.
///
/// Pushing past capacity silently evicts the oldest bytes; memory stays
/// bounded regardless of output volume.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(REPLAY_BUFFER_CAPACITY)
    }
}

impl ReplayBuffer {
    /// Create a buffer with the given byte capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ReplayBuffer capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity.min(65_536)),
            capacity,
        }
    }

    /// Append output, evicting the oldest bytes as needed.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            self.buf.drain(..needed - self.capacity);
        }
        self.buf.extend(data);
    }

    /// Contiguous copy of the buffered output, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut v = Vec::with_capacity(a.len() + b.len());
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        v
    }

    /// SHA-256 of the current contents, hex-encoded (for `STATE_SYNC`).
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let (a, b) = self.buf.as_slices();
        hasher.update(a);
        hasher.update(b);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Current number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
