//! Application-wide constants for always-coder.
//!
//! This module centralizes protocol and timing constants so the CLI, the
//! relay, and the tests agree on one set of numbers. Constants are grouped
//! by domain with documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Wire protocol version carried on every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum size of a single transport frame in bytes (64 KiB).
///
/// Applies to the encoded frame, not the inner plaintext. A frame of
/// exactly this size is accepted; one byte more is rejected before routing.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Chunk size for terminal output before encryption (48 KiB).
///
/// Base64 and envelope framing add roughly a third of overhead, so 48 KiB
/// of plaintext keeps the encoded envelope under [`MAX_FRAME_BYTES`].
pub const OUTPUT_CHUNK_BYTES: usize = 48 * 1024;

/// Alphabet for session ids. Ambiguous glyphs (0/O, 1/I/L) are excluded.
pub const SESSION_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a session id in characters.
pub const SESSION_ID_LEN: usize = 6;

// ============================================================================
// Heartbeat & liveness
// ============================================================================

/// Interval between PING frames from the CLI, and between relay sweeps.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no inbound frame for this long is evicted.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

// ============================================================================
// Lifetimes
// ============================================================================

/// Sessions expire this long after their last activity.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cached envelopes older than this are evicted.
pub const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Maximum number of envelopes cached per session.
pub const MESSAGE_CACHE_MAX: usize = 1000;

// ============================================================================
// Reconnect backoff
// ============================================================================

/// First reconnect delay. Doubles on each failed attempt.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Ceiling for the reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Reconnection is abandoned after this many attempts.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// Deadlines & queues
// ============================================================================

/// Upper bound for a single relay dispatch call.
pub const DISPATCH_DEADLINE: Duration = Duration::from_secs(5);

/// Overall deadline for a remote list/info query.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(10);

/// Capacity of the CLI's outbound envelope queue. Overflow drops the
/// oldest terminal output (the relay cache covers short gaps on rejoin).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Grace period between SIGTERM and SIGKILL when tearing down the PTY.
pub const PTY_KILL_GRACE: Duration = Duration::from_secs(2);

/// Consecutive decryption failures tolerated from one peer before removal.
pub const MAX_DECRYPT_FAILURES: u32 = 5;
