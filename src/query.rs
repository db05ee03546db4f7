//! Short-lived synchronous queries against the relay.
//!
//! `list`, `info`, `delete`, and label updates share one shape: open an
//! authenticated transport, send a single request, await the matching
//! response or an `ERROR`, close. The whole exchange runs under a 10 s
//! deadline; hitting it yields [`QueryError::Timeout`] and the transport
//! is dropped.
//!
//! Deletion has no dedicated acknowledgement on the wire. The client
//! pipelines a `PING` behind the request: the relay serializes dispatch
//! per connection, so a `PONG` arriving with no prior `ERROR` proves the
//! delete was applied.

use crate::constants::QUERY_DEADLINE;
use crate::protocol::{ControlMessage, ErrorCode, Frame, SessionSummary};
use crate::ws::{self, WsEvent, WsReader};

/// Remote query failure.
#[derive(Debug)]
pub enum QueryError {
    /// The relay could not be reached.
    Unreachable(String),
    /// The 10 s deadline elapsed.
    Timeout,
    /// The relay answered with an error frame.
    Relay {
        /// Wire error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// The transport closed or misbehaved mid-exchange.
    Transport(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(msg) => write!(f, "server unreachable: {msg}"),
            Self::Timeout => write!(f, "query timed out"),
            Self::Relay { code, message } => write!(f, "relay error {code:?}: {message}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

/// List sessions owned by the authenticated user.
///
/// # Errors
///
/// Returns a [`QueryError`] on transport failure, relay refusal, or
/// deadline expiry.
pub async fn list_sessions(
    server: &str,
    token: &str,
    include_inactive: bool,
) -> Result<Vec<SessionSummary>, QueryError> {
    let request = ControlMessage::SessionListRequest { include_inactive };
    match roundtrip(server, token, &[request]).await? {
        ControlMessage::SessionListResponse { sessions } => Ok(sessions),
        other => Err(unexpected(&other)),
    }
}

/// Fetch one owned session's record.
///
/// # Errors
///
/// Returns a [`QueryError`]; `SESSION_NOT_FOUND` arrives as
/// [`QueryError::Relay`].
pub async fn session_info(
    server: &str,
    token: &str,
    session_id: &str,
) -> Result<SessionSummary, QueryError> {
    let request = ControlMessage::SessionInfoRequest {
        session_id: session_id.to_string(),
    };
    match roundtrip(server, token, &[request]).await? {
        ControlMessage::SessionInfoResponse { session } => Ok(session),
        other => Err(unexpected(&other)),
    }
}

/// Patch a session's instance label. Returns the updated record.
///
/// # Errors
///
/// Returns a [`QueryError`] on refusal or transport failure.
pub async fn update_session_label(
    server: &str,
    token: &str,
    session_id: &str,
    label: &str,
) -> Result<SessionSummary, QueryError> {
    let request = ControlMessage::SessionUpdate {
        session_id: session_id.to_string(),
        label: Some(label.to_string()),
    };
    match roundtrip(server, token, &[request]).await? {
        ControlMessage::SessionInfoResponse { session } => Ok(session),
        other => Err(unexpected(&other)),
    }
}

/// Delete an owned session.
///
/// # Errors
///
/// Returns a [`QueryError`] on refusal or transport failure.
pub async fn delete_session(server: &str, token: &str, session_id: &str) -> Result<(), QueryError> {
    let request = ControlMessage::SessionDeleteRequest {
        session_id: session_id.to_string(),
    };
    // PING rides behind the delete; PONG without an ERROR means applied.
    match roundtrip(server, token, &[request, ControlMessage::Ping]).await? {
        ControlMessage::Pong => Ok(()),
        other => Err(unexpected(&other)),
    }
}

/// Open, send `requests` in order, return the first meaningful response.
async fn roundtrip(
    server: &str,
    token: &str,
    requests: &[ControlMessage],
) -> Result<ControlMessage, QueryError> {
    let deadline = tokio::time::Instant::now() + QUERY_DEADLINE;

    let connect = tokio::time::timeout_at(deadline, ws::connect(server, Some(token)));
    let (mut writer, mut reader) = match connect.await {
        Ok(Ok(halves)) => halves,
        Ok(Err(e)) => return Err(QueryError::Unreachable(e.to_string())),
        Err(_) => return Err(QueryError::Timeout),
    };

    for request in requests {
        let text = Frame::Control(request.clone()).encode();
        if let Err(e) = writer.send_frame(&text).await {
            return Err(QueryError::Transport(e.to_string()));
        }
    }

    let response = await_response(&mut reader, deadline).await;
    let _ = writer.send_close().await;
    response
}

async fn await_response(
    reader: &mut WsReader,
    deadline: tokio::time::Instant,
) -> Result<ControlMessage, QueryError> {
    loop {
        let event = match tokio::time::timeout_at(deadline, reader.recv()).await {
            Ok(event) => event,
            Err(_) => return Err(QueryError::Timeout),
        };

        let text = match event {
            Some(Ok(WsEvent::Frame(text))) => text,
            Some(Ok(WsEvent::Closed { .. })) | None => {
                return Err(QueryError::Transport("transport closed".into()));
            }
            Some(Err(e)) => return Err(QueryError::Transport(e.to_string())),
        };

        match Frame::parse(&text) {
            Ok(Frame::Control(ControlMessage::Error { code, message })) => {
                return Err(QueryError::Relay { code, message });
            }
            Ok(Frame::Control(msg)) => return Ok(msg),
            // Stray envelopes and unparseable frames are not for us.
            Ok(Frame::Envelope(_)) => continue,
            Err(e) => {
                log::debug!("Ignoring frame during query: {e}");
                continue;
            }
        }
    }
}

fn unexpected(msg: &ControlMessage) -> QueryError {
    QueryError::Transport(format!("unexpected response: {msg:?}"))
}
