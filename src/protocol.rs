//! Wire protocol: control frames, encrypted envelopes, and inner messages.
//!
//! A *frame* is one UTF-8 JSON object per transport message. Two top-level
//! shapes exist:
//!
//! - **Control messages** — plaintext, tagged by a `type` field
//!   (`SESSION_CREATE`, `PONG`, `web:connected`, ...). Routed and read by
//!   the relay.
//! - **Envelopes** — authenticated ciphertext carrying one serialized
//!   [`Message`]. The relay forwards these opaquely; only the session id
//!   is readable, and only for lookup.
//!
//! A peer distinguishes the two by checking the envelope invariants
//! (`version == 1` plus the four required fields), not by a tag, so a
//! control message can never be mistaken for ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FRAME_BYTES, PROTOCOL_VERSION};

/// Wire-visible error codes carried in `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Lookup miss on an operation that names an existing session.
    SessionNotFound,
    /// The session's TTL elapsed.
    SessionExpired,
    /// Create collided with an existing session id.
    SessionFull,
    /// Public key failed to decode or had the wrong length.
    InvalidPublicKey,
    /// Internal encryption failure.
    EncryptionFailed,
    /// MAC verification failed.
    DecryptionFailed,
    /// Schema violation or oversized frame.
    InvalidMessage,
    /// Transport or handshake failure.
    ConnectionFailed,
    /// Missing/invalid token, or cross-owner access.
    Unauthorized,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "cli-detached")]
    CliDetached,
    #[serde(rename = "closed")]
    Closed,
}

/// Session record as exposed in list/info responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Six-character session id.
    pub session_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Command the host is running.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working-directory hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Instance label (defaults to the host's hostname).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Owning user id (`anonymous` for unauthenticated sessions).
    pub owner: String,
    /// Number of currently attached web peers.
    pub web_peers: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity time (drives the TTL).
    pub last_active_at: DateTime<Utc>,
}

/// Plaintext control messages, in both directions.
///
/// The `type` strings are part of the wire contract and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    // ── client → relay ────────────────────────────────────────────────────
    #[serde(rename = "SESSION_CREATE", rename_all = "camelCase")]
    SessionCreate {
        session_id: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "SESSION_RECONNECT", rename_all = "camelCase")]
    SessionReconnect {
        session_id: String,
        public_key: String,
    },
    #[serde(rename = "SESSION_JOIN", rename_all = "camelCase")]
    SessionJoin {
        session_id: String,
        public_key: String,
    },
    #[serde(rename = "SESSION_UPDATE", rename_all = "camelCase")]
    SessionUpdate {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "SESSION_LIST_REQUEST", rename_all = "camelCase")]
    SessionListRequest {
        #[serde(default)]
        include_inactive: bool,
    },
    #[serde(rename = "SESSION_INFO_REQUEST", rename_all = "camelCase")]
    SessionInfoRequest { session_id: String },
    #[serde(rename = "SESSION_DELETE_REQUEST", rename_all = "camelCase")]
    SessionDeleteRequest { session_id: String },
    #[serde(rename = "PING")]
    Ping,

    // ── relay → client ────────────────────────────────────────────────────
    #[serde(rename = "SESSION_CREATED", rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        ws_endpoint: String,
    },
    #[serde(rename = "SESSION_RECONNECTED", rename_all = "camelCase")]
    SessionReconnected {
        session_id: String,
        ws_endpoint: String,
    },
    #[serde(rename = "SESSION_LIST_RESPONSE", rename_all = "camelCase")]
    SessionListResponse { sessions: Vec<SessionSummary> },
    #[serde(rename = "SESSION_INFO_RESPONSE", rename_all = "camelCase")]
    SessionInfoResponse { session: SessionSummary },
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ERROR")]
    Error { code: ErrorCode, message: String },
    #[serde(rename = "web:connected", rename_all = "camelCase")]
    WebConnected {
        public_key: String,
        connection_id: String,
    },
    #[serde(rename = "web:disconnected", rename_all = "camelCase")]
    WebDisconnected { connection_id: String },
    #[serde(rename = "cli:connected", rename_all = "camelCase")]
    CliConnected {
        /// Current CLI public key, for the web peer's key derivation.
        public_key: String,
    },
    #[serde(rename = "cli:disconnected")]
    CliDisconnected,
}

/// Kinds of messages carried inside envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// PTY output, CLI → web.
    TerminalOutput,
    /// Keystrokes, web → CLI.
    TerminalInput,
    /// Dimension change, web → CLI.
    TerminalResize,
    /// Current dimensions + output hash, CLI → web on join/reconnect.
    StateSync,
    /// Diagnostic when the input filter dropped bytes, CLI → web.
    BlockedSignal,
}

/// The inner, integrity-protected message sealed inside an envelope.
///
/// `session_id` duplicates the envelope's cleartext id; receivers reject
/// messages whose inner id disagrees with the envelope they arrived in,
/// which defeats relabeling by the relay or anyone on the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Message {
    /// Build a terminal-output message from raw PTY bytes.
    pub fn terminal_output(data: &str, seq: u64, session_id: &str) -> Self {
        Self {
            kind: MessageKind::TerminalOutput,
            payload: serde_json::Value::String(data.to_string()),
            seq,
            session_id: Some(session_id.to_string()),
        }
    }

    /// Build a terminal-input message.
    pub fn terminal_input(data: &str, seq: u64, session_id: &str) -> Self {
        Self {
            kind: MessageKind::TerminalInput,
            payload: serde_json::Value::String(data.to_string()),
            seq,
            session_id: Some(session_id.to_string()),
        }
    }
}

/// An authenticated-encrypted wire frame carrying one [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Protocol version (always 1).
    pub version: u8,
    /// Session id, cleartext for relay routing only. Not authenticated.
    pub session_id: String,
    /// Base64 of the 24-byte random nonce.
    pub nonce: String,
    /// Base64 of ciphertext + MAC.
    pub ciphertext: String,
    /// Sender timestamp, milliseconds since the epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Check whether a parsed JSON value has the envelope shape.
    fn matches(value: &serde_json::Value) -> bool {
        value.get("version").and_then(serde_json::Value::as_u64)
            == Some(u64::from(PROTOCOL_VERSION))
            && value.get("sessionId").is_some()
            && value.get("nonce").is_some()
            && value.get("ciphertext").is_some()
            && value.get("timestamp").is_some()
    }
}

/// One decoded transport frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A plaintext control message.
    Control(ControlMessage),
    /// An opaque encrypted envelope.
    Envelope(Envelope),
}

/// Frame decode failure.
#[derive(Debug)]
pub enum FrameError {
    /// Frame exceeded [`MAX_FRAME_BYTES`].
    TooLarge(usize),
    /// Frame was not valid JSON or matched neither shape.
    Malformed(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(size) => {
                write!(f, "frame of {size} bytes exceeds {MAX_FRAME_BYTES} byte limit")
            }
            Self::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    /// Parse a transport frame, enforcing the size cap before anything else.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] for frames over 64 KiB and
    /// [`FrameError::Malformed`] for anything that is neither a control
    /// message nor an envelope.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(text.len()));
        }

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        if Envelope::matches(&value) {
            let envelope: Envelope =
                serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))?;
            return Ok(Self::Envelope(envelope));
        }

        let control: ControlMessage =
            serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok(Self::Control(control))
    }

    /// Serialize the frame back to a single JSON transport message.
    pub fn encode(&self) -> String {
        match self {
            Self::Control(msg) => {
                serde_json::to_string(msg).expect("control message serializable")
            }
            Self::Envelope(env) => serde_json::to_string(env).expect("envelope serializable"),
        }
    }
}
