//! WebSocket accept loop for the session relay.
//!
//! Binds a TCP listener and spawns one task per accepted connection. The
//! bearer token, if any, arrives as a `?token=` query parameter on the
//! upgrade request; it is verified once, at accept time, and the identity
//! is attached to the connection record.
//!
//! Each connection task is a single `select!` loop: inbound frames become
//! dispatch calls, frames queued by the dispatcher are written out in
//! order. When the registry drops a connection's sender (eviction, session
//! delete), the queue closes and the task shuts the socket down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::TokenVerifier;
use crate::constants::HEARTBEAT_INTERVAL;

use super::dispatch::Dispatcher;

/// The running relay: listener, sweeper, and shared dispatcher.
pub struct RelayServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Bind the listener and start accepting connections.
    ///
    /// `ws_endpoint` is the advertised URL echoed in `SESSION_CREATED`.
    /// Without a `verifier`, every presented token is treated as invalid
    /// and only anonymous sessions are possible.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        bind_addr: &str,
        ws_endpoint: String,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Dispatcher::new(ws_endpoint);
        log::info!("Relay listening on {local_addr}");

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher.clone(),
            verifier,
        ));

        let sweeper = dispatcher.clone();
        let sweeper_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweeper.sweep();
            }
        });

        Ok(Self {
            local_addr,
            accept_handle,
            sweeper_handle,
        })
    }

    /// Address the listener actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and sweeping. Existing connection tasks end when
    /// their sockets do.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        self.sweeper_handle.abort();
    }

    /// Accept loop — runs as a tokio task.
    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Dispatcher,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let dispatcher = dispatcher.clone();
                    let verifier = verifier.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, dispatcher, verifier).await
                        {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serve one transport until it closes or is evicted.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Dispatcher,
    verifier: Option<Arc<dyn TokenVerifier>>,
) -> Result<()> {
    let mut token: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            token = req.uri().query().and_then(token_from_query);
            Ok(resp)
        },
    )
    .await
    .context("WebSocket handshake failed")?;

    let user = match (token, &verifier) {
        (Some(token), Some(verifier)) => match verifier.verify(&token).await {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Token verification failed for {addr}: {e}");
                None
            }
        },
        (Some(_), None) => {
            log::debug!("Token presented but no verifier configured");
            None
        }
        (None, _) => None,
    };

    let (mut sink, mut reader) = ws_stream.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let conn_id = dispatcher.register_connection(user, tx);
    log::info!("Connection {conn_id} accepted from {addr}");

    let _closed_guard = scopeguard::guard((dispatcher.clone(), conn_id.clone()), |(d, id)| {
        d.connection_closed(&id);
    });

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped us (eviction); close the socket.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher.dispatch(&conn_id, text.as_ref());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        dispatcher.touch(&conn_id);
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        dispatcher.touch(&conn_id);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::debug!("Ignoring binary frame from {conn_id}");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::debug!("Read error on {conn_id}: {e}");
                        break;
                    }
                }
            }
        }
    }

    log::info!("Connection {conn_id} closed");
    Ok(())
}

/// Extract `token=` from a raw query string.
fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("token=")
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("token=abc"), Some("abc".to_string()));
        assert_eq!(
            token_from_query("foo=1&token=xyz&bar=2"),
            Some("xyz".to_string())
        );
        assert_eq!(token_from_query("foo=1"), None);
        assert_eq!(token_from_query("token="), None);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::bind("127.0.0.1:0", "wss://relay.test/ws".into(), None)
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.shutdown();
    }
}
