//! Relay transport for the CLI side.
//!
//! The wire protocol is one JSON object per text frame, so this module
//! exposes exactly that: a writer that sends frames and a reader that
//! yields [`WsEvent::Frame`] or [`WsEvent::Closed`]. Everything else the
//! WebSocket layer can produce is handled internally — transport pings
//! are answered by the library, and the relay never sends binary data.
//!
//! URL handling also lives here: user-supplied web URLs are normalized
//! to `http[s]://` without trailing slashes, and [`to_relay_scheme`]
//! maps them onto the relay's `ws[s]://` scheme.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Something the relay transport produced.
#[derive(Debug)]
pub enum WsEvent {
    /// One JSON protocol frame.
    Frame(String),
    /// The relay closed the transport. Code 1000 is a deliberate close;
    /// anything else is worth reconnecting through.
    Closed {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
    },
}

/// Write half of a relay connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send one JSON protocol frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_frame(&mut self, frame: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(frame.to_string()))
            .await
            .context("WebSocket send failed")
    }

    /// Close the transport deliberately (code 1000).
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be sent.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(Some(
                tungstenite::protocol::CloseFrame {
                    code: tungstenite::protocol::frame::coding::CloseCode::Normal,
                    reason: "".into(),
                },
            )))
            .await
            .context("WebSocket close failed")
    }
}

/// Read half of a relay connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next transport event, or `None` when the stream ends without a
    /// close frame.
    pub async fn recv(&mut self) -> Option<Result<WsEvent>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(WsEvent::Frame(text.to_string())));
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let code = close_frame.map_or(1005, |cf| cf.code.into());
                    return Some(Ok(WsEvent::Closed { code }));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    // The protocol is text-only; nothing legitimate sends this.
                    log::warn!("Ignoring {}-byte binary frame from relay", data.len());
                }
                // Pings are answered by tungstenite itself; pongs and raw
                // frames carry nothing for us.
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
            }
        }
    }
}

/// Connect to the relay, attaching the bearer token as a query parameter.
///
/// Returns split (writer, reader) halves for independent use in
/// `tokio::select!` loops.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the WebSocket handshake fails.
pub async fn connect(url: &str, token: Option<&str>) -> Result<(WsWriter, WsReader)> {
    let url = match token {
        Some(token) if !token.is_empty() => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}token={token}")
        }
        _ => url.to_string(),
    };

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("WebSocket connect failed: {url}"))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Map an HTTP(S) URL onto the relay's WS(S) scheme.
///
/// `ws://` and `wss://` inputs pass through unchanged.
#[must_use]
pub fn to_relay_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some(("http", rest)) => format!("ws://{rest}"),
        Some(("https", rest)) => format!("wss://{rest}"),
        _ => url.to_string(),
    }
}

/// Normalize a user-supplied HTTP(S) URL.
///
/// Adds `https://` when the scheme is missing and strips trailing slashes.
/// Idempotent: `normalize_url(normalize_url(x)) == normalize_url(x)`.
///
/// # Errors
///
/// Returns an error for schemes other than `http` or `https`.
pub fn normalize_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty URL");
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    if !with_scheme.starts_with("http://") && !with_scheme.starts_with("https://") {
        anyhow::bail!("unsupported URL scheme: {with_scheme}");
    }

    Ok(with_scheme.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_relay_scheme_https() {
        assert_eq!(
            to_relay_scheme("https://example.com/ws"),
            "wss://example.com/ws"
        );
    }

    #[test]
    fn test_to_relay_scheme_http() {
        assert_eq!(
            to_relay_scheme("http://localhost:3000"),
            "ws://localhost:3000"
        );
    }

    #[test]
    fn test_to_relay_scheme_ws_passthrough() {
        assert_eq!(
            to_relay_scheme("wss://relay.example.com/ws"),
            "wss://relay.example.com/ws"
        );
        assert_eq!(to_relay_scheme("ws://127.0.0.1:1/ws"), "ws://127.0.0.1:1/ws");
    }

    #[test]
    fn test_to_relay_scheme_schemeless_passthrough() {
        assert_eq!(to_relay_scheme("example.com"), "example.com");
    }

    #[test]
    fn test_normalize_adds_https() {
        assert_eq!(
            normalize_url("relay.example.com").unwrap(),
            "https://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_slashes() {
        assert_eq!(
            normalize_url("https://example.com///").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_url("example.com/path/").unwrap();
        let twice = normalize_url(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, "https://example.com/path");
    }

    #[test]
    fn test_normalize_keeps_http() {
        assert_eq!(
            normalize_url("http://localhost:3000/").unwrap(),
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_normalize_rejects_other_schemes() {
        assert!(normalize_url("ftp://example.com").is_err());
        assert!(normalize_url("").is_err());
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/invalid", Some("tok")).await;
        assert!(result.is_err());
    }
}
