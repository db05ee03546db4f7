//! Per-message routing for the session relay.
//!
//! Every inbound transport frame becomes one [`Dispatcher::dispatch`] call
//! in the context of its connection id. Dispatch decides by role and
//! session membership, queues outbound frames on peer channels, and never
//! reads envelope payloads. All state mutation happens under one lock;
//! outbound sends go through unbounded per-peer queues, so no await is
//! ever held across the lock.
//!
//! A connection's misbehaviour is answered with an `ERROR` frame, not a
//! close: the relay keeps serving the transport unless it disconnects.

use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::mpsc::UnboundedSender;

use crate::auth::AuthUser;
use crate::protocol::{ControlMessage, Envelope, ErrorCode, Frame, FrameError};

use super::cache::MessageCache;
use super::registry::{ConnectionRegistry, Role};
use super::store::{SessionMeta, SessionStore, StoreError};

/// Shared mutable relay state: connections, sessions, cached envelopes.
#[derive(Debug, Default)]
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub store: SessionStore,
    pub cache: MessageCache,
}

/// Routes frames between connections according to role and ownership.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<RelayState>>,
    /// Advertised endpoint echoed in `SESSION_CREATED`.
    ws_endpoint: String,
}

impl Dispatcher {
    /// Create a dispatcher advertising the given endpoint.
    #[must_use]
    pub fn new(ws_endpoint: String) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            ws_endpoint,
        }
    }

    /// Register a newly accepted transport. Returns its connection id.
    pub fn register_connection(
        &self,
        user: Option<AuthUser>,
        sender: UnboundedSender<String>,
    ) -> String {
        self.lock().registry.register(user, sender)
    }

    /// Handle one inbound frame from `conn_id`.
    pub fn dispatch(&self, conn_id: &str, text: &str) {
        let mut state = self.lock();
        state.registry.heartbeat(conn_id);

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                let code = match err {
                    FrameError::TooLarge(_) | FrameError::Malformed(_) => ErrorCode::InvalidMessage,
                };
                send(&state, conn_id, &error(code, &err.to_string()));
                return;
            }
        };

        match frame {
            Frame::Control(msg) => self.dispatch_control(&mut state, conn_id, msg),
            Frame::Envelope(envelope) => Self::dispatch_envelope(&mut state, conn_id, &envelope),
        }
    }

    /// Record liveness for a non-dispatch frame (transport ping/pong).
    pub fn touch(&self, conn_id: &str) {
        self.lock().registry.heartbeat(conn_id);
    }

    /// Tear down a connection that closed (or was evicted).
    pub fn connection_closed(&self, conn_id: &str) {
        let mut state = self.lock();
        Self::detach_connection(&mut state, conn_id);
    }

    /// Periodic maintenance: evict silent connections, drop expired
    /// sessions, purge their caches.
    pub fn sweep(&self) {
        let mut state = self.lock();

        let evicted = state.registry.sweep();
        for record in &evicted {
            log::info!("Evicting silent connection {}", record.id);
        }
        // Records are already out of the registry; run the disconnect path
        // so sessions and peers observe a normal close.
        for record in evicted {
            Self::notify_departure(
                &mut state,
                &record.id,
                record.session_id.as_deref(),
                record.role,
            );
        }

        for id in state.store.purge_expired() {
            log::info!("Session {id} expired");
            state.cache.purge(&id);
        }
    }

    /// Number of live connections (for the relay's status logging).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().registry.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().expect("relay state lock poisoned")
    }

    // ── control frames ────────────────────────────────────────────────────

    fn dispatch_control(&self, state: &mut RelayState, conn_id: &str, msg: ControlMessage) {
        let bound = state
            .registry
            .get(conn_id)
            .is_some_and(|r| r.session_id.is_some());
        let user = state.registry.get(conn_id).and_then(|r| r.user.clone());

        match msg {
            ControlMessage::Ping => {
                send(state, conn_id, &ControlMessage::Pong);
            }

            ControlMessage::SessionCreate {
                session_id,
                public_key,
                command,
                args,
                cwd,
                label,
            } => {
                if bound {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidMessage, "connection already bound"),
                    );
                    return;
                }
                if !valid_public_key(&public_key) {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidPublicKey, "public key must be 32 bytes"),
                    );
                    return;
                }

                let meta = SessionMeta {
                    command: command.unwrap_or_default(),
                    args,
                    cwd,
                    label,
                };
                let owner = user.as_ref().map(|u| u.user_id.clone());
                match state
                    .store
                    .create(&session_id, owner.as_deref(), &public_key, conn_id, meta)
                {
                    Ok(_) => {
                        state.registry.bind(conn_id, &session_id, Role::Cli);
                        log::info!("Session {session_id} created by {conn_id}");
                        send(
                            state,
                            conn_id,
                            &ControlMessage::SessionCreated {
                                session_id,
                                ws_endpoint: self.ws_endpoint.clone(),
                            },
                        );
                    }
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            ControlMessage::SessionReconnect {
                session_id,
                public_key,
            } => {
                if bound {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidMessage, "connection already bound"),
                    );
                    return;
                }
                if !valid_public_key(&public_key) {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidPublicKey, "public key must be 32 bytes"),
                    );
                    return;
                }

                let caller = user.as_ref().map(|u| u.user_id.clone());
                match state
                    .store
                    .reconnect_cli(&session_id, caller.as_deref(), &public_key, conn_id)
                {
                    Ok(outcome) => {
                        if outcome.key_rotated {
                            // Cached ciphertext is sealed under the old key;
                            // nobody can open it any more.
                            state.cache.purge(&session_id);
                        }
                        state.registry.bind(conn_id, &session_id, Role::Cli);
                        log::info!("Session {session_id}: CLI reconnected as {conn_id}");

                        send(
                            state,
                            conn_id,
                            &ControlMessage::SessionReconnected {
                                session_id: session_id.clone(),
                                ws_endpoint: self.ws_endpoint.clone(),
                            },
                        );

                        // Cached control state: the CLI learns of every web
                        // peer (and its key) so it can renegotiate, each web
                        // peer learns the CLI is back.
                        let web_peers = match state.store.get(&session_id) {
                            Ok(session) => session.web_peers.clone(),
                            Err(_) => Vec::new(),
                        };
                        for peer in web_peers {
                            send(
                                state,
                                conn_id,
                                &ControlMessage::WebConnected {
                                    public_key: peer.public_key.clone(),
                                    connection_id: peer.conn.clone(),
                                },
                            );
                            send(
                                state,
                                &peer.conn,
                                &ControlMessage::CliConnected {
                                    public_key: public_key.clone(),
                                },
                            );
                        }
                    }
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            ControlMessage::SessionJoin {
                session_id,
                public_key,
            } => {
                if bound {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidMessage, "connection already bound"),
                    );
                    return;
                }
                if !valid_public_key(&public_key) {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::InvalidPublicKey, "public key must be 32 bytes"),
                    );
                    return;
                }

                match state.store.join_web(&session_id, &public_key, conn_id) {
                    Ok(session) => {
                        let cli_conn = session.cli_conn.clone();
                        let cli_public_key = session.cli_public_key.clone();
                        state.registry.bind(conn_id, &session_id, Role::Web);
                        log::info!("Session {session_id}: web peer {conn_id} joined");

                        if let Some(cli_conn) = cli_conn {
                            send(
                                state,
                                &cli_conn,
                                &ControlMessage::WebConnected {
                                    public_key,
                                    connection_id: conn_id.to_string(),
                                },
                            );
                            send(
                                state,
                                conn_id,
                                &ControlMessage::CliConnected {
                                    public_key: cli_public_key,
                                },
                            );
                        }

                        // Best-effort replay of the live cache. Entries are
                        // only useful to a peer rejoining under the same CLI
                        // key; a fresh-key peer cannot open them and relies
                        // on the CLI's own replay instead.
                        for envelope in state.cache.replay(&session_id) {
                            send_frame(state, conn_id, &Frame::Envelope(envelope));
                        }
                    }
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            ControlMessage::SessionListRequest { include_inactive } => {
                let Some(user) = user else {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::Unauthorized, "authentication required"),
                    );
                    return;
                };
                let sessions = state
                    .store
                    .list(&user.user_id, include_inactive)
                    .iter()
                    .map(|s| s.summary())
                    .collect();
                send(state, conn_id, &ControlMessage::SessionListResponse { sessions });
            }

            ControlMessage::SessionInfoRequest { session_id } => {
                let Some(user) = user else {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::Unauthorized, "authentication required"),
                    );
                    return;
                };
                match state.store.get(&session_id) {
                    Ok(session) if session.owner == user.user_id => {
                        let session = session.summary();
                        send(state, conn_id, &ControlMessage::SessionInfoResponse { session });
                    }
                    Ok(_) => send(
                        state,
                        conn_id,
                        &error(ErrorCode::Unauthorized, "not the session owner"),
                    ),
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            ControlMessage::SessionUpdate { session_id, label } => {
                let Some(user) = user else {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::Unauthorized, "authentication required"),
                    );
                    return;
                };
                match state.store.update(&session_id, Some(&user.user_id), label) {
                    Ok(session) => {
                        let session = session.summary();
                        send(state, conn_id, &ControlMessage::SessionInfoResponse { session });
                    }
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            ControlMessage::SessionDeleteRequest { session_id } => {
                let Some(user) = user else {
                    send(
                        state,
                        conn_id,
                        &error(ErrorCode::Unauthorized, "authentication required"),
                    );
                    return;
                };
                match state.store.delete(&session_id, Some(&user.user_id)) {
                    Ok(removed) => {
                        log::info!("Session {session_id} deleted by {}", user.user_id);
                        state.cache.purge(&session_id);
                        for peer in &removed.web_peers {
                            send(state, &peer.conn, &ControlMessage::CliDisconnected);
                        }
                        for conn in removed
                            .web_peers
                            .iter()
                            .map(|p| p.conn.as_str())
                            .chain(removed.cli_conn.as_deref())
                        {
                            state.registry.bind_cleared(conn);
                        }
                    }
                    Err(err) => send_store_error(state, conn_id, &err),
                }
            }

            // Relay-originated kinds are never valid inbound.
            ControlMessage::SessionCreated { .. }
            | ControlMessage::SessionReconnected { .. }
            | ControlMessage::SessionListResponse { .. }
            | ControlMessage::SessionInfoResponse { .. }
            | ControlMessage::Pong
            | ControlMessage::Error { .. }
            | ControlMessage::WebConnected { .. }
            | ControlMessage::WebDisconnected { .. }
            | ControlMessage::CliConnected { .. }
            | ControlMessage::CliDisconnected => {
                send(
                    state,
                    conn_id,
                    &error(ErrorCode::InvalidMessage, "not a client message"),
                );
            }
        }
    }

    // ── envelopes ─────────────────────────────────────────────────────────

    fn dispatch_envelope(state: &mut RelayState, conn_id: &str, envelope: &Envelope) {
        let Some(record) = state.registry.get(conn_id) else {
            return;
        };
        let (session_id, role) = match (&record.session_id, record.role) {
            (Some(session_id), Some(role)) => (session_id.clone(), role),
            _ => {
                send(
                    state,
                    conn_id,
                    &error(ErrorCode::Unauthorized, "connection not bound to a session"),
                );
                return;
            }
        };

        if session_id != envelope.session_id {
            send(
                state,
                conn_id,
                &error(ErrorCode::SessionNotFound, "envelope for a different session"),
            );
            return;
        }

        match role {
            Role::Cli => {
                let web_conns: Vec<String> = match state.store.get(&session_id) {
                    Ok(session) if session.cli_conn.as_deref() == Some(conn_id) => {
                        session.web_peers.iter().map(|p| p.conn.clone()).collect()
                    }
                    _ => {
                        send(
                            state,
                            conn_id,
                            &error(ErrorCode::SessionNotFound, "CLI not bound to session"),
                        );
                        return;
                    }
                };

                let frame = Frame::Envelope(envelope.clone());
                for web_conn in &web_conns {
                    send_frame(state, web_conn, &frame);
                }
                state.cache.push(&session_id, envelope.clone());
            }
            Role::Web => {
                // Routed only to the CLI; never cached.
                let cli_conn = state
                    .store
                    .get(&session_id)
                    .ok()
                    .and_then(|s| s.cli_conn.clone());
                match cli_conn {
                    Some(cli_conn) => {
                        send_frame(state, &cli_conn, &Frame::Envelope(envelope.clone()));
                    }
                    None => {
                        log::debug!("Dropping web envelope for detached session {session_id}");
                    }
                }
            }
        }
    }

    // ── disconnect handling ───────────────────────────────────────────────

    fn detach_connection(state: &mut RelayState, conn_id: &str) {
        let Some(record) = state.registry.remove(conn_id) else {
            return;
        };
        Self::notify_departure(state, conn_id, record.session_id.as_deref(), record.role);
    }

    fn notify_departure(
        state: &mut RelayState,
        conn_id: &str,
        session_id: Option<&str>,
        role: Option<Role>,
    ) {
        let Some(session_id) = session_id else { return };
        state.store.leave(session_id, conn_id);

        match role {
            Some(Role::Cli) => {
                log::info!("Session {session_id}: CLI detached");
                let web_conns: Vec<String> = match state.store.get(session_id) {
                    Ok(session) => session.web_peers.iter().map(|p| p.conn.clone()).collect(),
                    Err(_) => Vec::new(),
                };
                for web_conn in web_conns {
                    send(state, &web_conn, &ControlMessage::CliDisconnected);
                }
            }
            Some(Role::Web) => {
                log::info!("Session {session_id}: web peer {conn_id} left");
                let cli_conn = state
                    .store
                    .get(session_id)
                    .ok()
                    .and_then(|s| s.cli_conn.clone());
                if let Some(cli_conn) = cli_conn {
                    send(
                        state,
                        &cli_conn,
                        &ControlMessage::WebDisconnected {
                            connection_id: conn_id.to_string(),
                        },
                    );
                }
            }
            None => {}
        }
    }
}

// ── helpers ───────────────────────────────────────────────────────────────

fn error(code: ErrorCode, message: &str) -> ControlMessage {
    ControlMessage::Error {
        code,
        message: message.to_string(),
    }
}

fn send_store_error(state: &RelayState, conn_id: &str, err: &StoreError) {
    send(state, conn_id, &error(err.wire_code(), &err.to_string()));
}

/// Queue a control message for one peer. Best-effort: failures are logged
/// and never fail the dispatch.
fn send(state: &RelayState, conn_id: &str, msg: &ControlMessage) {
    send_frame(state, conn_id, &Frame::Control(msg.clone()));
}

fn send_frame(state: &RelayState, conn_id: &str, frame: &Frame) {
    if !state.registry.send_to(conn_id, &frame.encode()) {
        log::debug!("Send to {conn_id} failed (peer gone)");
    }
}

fn valid_public_key(public_key: &str) -> bool {
    BASE64
        .decode(public_key)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::KeyPair;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Peer {
        conn_id: String,
        rx: UnboundedReceiver<String>,
    }

    impl Peer {
        fn recv(&mut self) -> ControlMessage {
            match self.recv_frame() {
                Frame::Control(msg) => msg,
                Frame::Envelope(env) => panic!("expected control, got envelope: {env:?}"),
            }
        }

        fn recv_frame(&mut self) -> Frame {
            let text = self.rx.try_recv().expect("no frame queued");
            Frame::parse(&text).expect("queued frame parses")
        }

        fn no_pending(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn connect(dispatcher: &Dispatcher, user: Option<(&str, &str)>) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = user.map(|(id, email)| AuthUser {
            user_id: id.to_string(),
            email: email.to_string(),
        });
        let conn_id = dispatcher.register_connection(user, tx);
        Peer { conn_id, rx }
    }

    fn pk() -> String {
        KeyPair::new().public_key()
    }

    fn create_session(dispatcher: &Dispatcher, peer: &Peer, session_id: &str, key: &str) {
        dispatcher.dispatch(
            &peer.conn_id,
            &format!(
                r#"{{"type":"SESSION_CREATE","sessionId":"{session_id}","publicKey":"{key}","command":"bash"}}"#
            ),
        );
    }

    #[test]
    fn test_create_roundtrip() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        match cli.recv() {
            ControlMessage::SessionCreated {
                session_id,
                ws_endpoint,
            } => {
                assert_eq!(session_id, "ABCDEF");
                assert_eq!(ws_endpoint, "wss://relay.test/ws");
            }
            other => panic!("expected SESSION_CREATED, got {other:?}"),
        }
    }

    #[test]
    fn test_create_collision_gets_session_full() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut first = connect(&dispatcher, None);
        let mut second = connect(&dispatcher, None);

        create_session(&dispatcher, &first, "ABCDEF", &pk());
        first.recv();

        create_session(&dispatcher, &second, "ABCDEF", &pk());
        match second.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::SessionFull),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_create_rejects_bad_public_key() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", "dG9vc2hvcnQ=");
        match cli.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidPublicKey),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_join_notifies_both_sides() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);
        let mut web = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        cli.recv();

        let web_key = pk();
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{web_key}"}}"#),
        );

        match cli.recv() {
            ControlMessage::WebConnected {
                public_key,
                connection_id,
            } => {
                assert_eq!(public_key, web_key);
                assert_eq!(connection_id, web.conn_id);
            }
            other => panic!("expected web:connected, got {other:?}"),
        }
        assert!(matches!(web.recv(), ControlMessage::CliConnected { .. }));
    }

    #[test]
    fn test_join_missing_session() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut web = connect(&dispatcher, None);

        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"NOSUCH","publicKey":"{}"}}"#, pk()),
        );
        match web.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_envelope_fans_out_and_caches() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);
        let mut web_a = connect(&dispatcher, None);
        let mut web_b = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        cli.recv();
        for web in [&web_a, &web_b] {
            dispatcher.dispatch(
                &web.conn_id,
                &format!(
                    r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#,
                    pk()
                ),
            );
        }
        // Drain join notifications.
        cli.recv();
        cli.recv();
        web_a.recv();
        web_b.recv();

        let envelope = r#"{"version":1,"sessionId":"ABCDEF","nonce":"bg==","ciphertext":"Yw==","timestamp":1}"#;
        dispatcher.dispatch(&cli.conn_id, envelope);

        assert!(matches!(web_a.recv_frame(), Frame::Envelope(_)));
        assert!(matches!(web_b.recv_frame(), Frame::Envelope(_)));

        // A later joiner gets the cached envelope replayed.
        let mut late = connect(&dispatcher, None);
        dispatcher.dispatch(
            &late.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        cli.recv();
        assert!(matches!(late.recv(), ControlMessage::CliConnected { .. }));
        assert!(matches!(late.recv_frame(), Frame::Envelope(_)));
    }

    #[test]
    fn test_web_envelope_routed_to_cli_only_and_uncached() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);
        let mut web_a = connect(&dispatcher, None);
        let mut web_b = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        cli.recv();
        for web in [&web_a, &web_b] {
            dispatcher.dispatch(
                &web.conn_id,
                &format!(
                    r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#,
                    pk()
                ),
            );
        }
        cli.recv();
        cli.recv();
        web_a.recv();
        web_b.recv();

        let envelope = r#"{"version":1,"sessionId":"ABCDEF","nonce":"bg==","ciphertext":"Yw==","timestamp":1}"#;
        dispatcher.dispatch(&web_a.conn_id, envelope);

        assert!(matches!(cli.recv_frame(), Frame::Envelope(_)));
        assert!(web_b.no_pending(), "web peers must not see web input");

        // Not cached: a later joiner sees only join traffic.
        let mut late = connect(&dispatcher, None);
        dispatcher.dispatch(
            &late.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        cli.recv();
        assert!(matches!(late.recv(), ControlMessage::CliConnected { .. }));
        assert!(late.no_pending());
    }

    #[test]
    fn test_envelope_from_unbound_connection_unauthorized() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut stranger = connect(&dispatcher, None);

        let envelope = r#"{"version":1,"sessionId":"ABCDEF","nonce":"bg==","ciphertext":"Yw==","timestamp":1}"#;
        dispatcher.dispatch(&stranger.conn_id, envelope);
        match stranger.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_unauthenticated_list_unauthorized_and_stays_open() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut anon = connect(&dispatcher, None);

        dispatcher.dispatch(&anon.conn_id, r#"{"type":"SESSION_LIST_REQUEST"}"#);
        match anon.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
            other => panic!("expected ERROR, got {other:?}"),
        }

        // Still serviced afterwards.
        dispatcher.dispatch(&anon.conn_id, r#"{"type":"PING"}"#);
        assert!(matches!(anon.recv(), ControlMessage::Pong));
    }

    #[test]
    fn test_list_scoped_to_owner() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut alice_cli = connect(&dispatcher, Some(("alice", "a@example.com")));
        let mut bob = connect(&dispatcher, Some(("bob", "b@example.com")));

        create_session(&dispatcher, &alice_cli, "AAAAAA", &pk());
        alice_cli.recv();

        dispatcher.dispatch(&bob.conn_id, r#"{"type":"SESSION_LIST_REQUEST"}"#);
        match bob.recv() {
            ControlMessage::SessionListResponse { sessions } => assert!(sessions.is_empty()),
            other => panic!("expected SESSION_LIST_RESPONSE, got {other:?}"),
        }

        let mut alice_query = connect(&dispatcher, Some(("alice", "a@example.com")));
        dispatcher.dispatch(&alice_query.conn_id, r#"{"type":"SESSION_LIST_REQUEST"}"#);
        match alice_query.recv() {
            ControlMessage::SessionListResponse { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session_id, "AAAAAA");
            }
            other => panic!("expected SESSION_LIST_RESPONSE, got {other:?}"),
        }
    }

    #[test]
    fn test_info_requires_ownership() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut alice_cli = connect(&dispatcher, Some(("alice", "a@example.com")));
        let mut bob = connect(&dispatcher, Some(("bob", "b@example.com")));

        create_session(&dispatcher, &alice_cli, "AAAAAA", &pk());
        alice_cli.recv();

        dispatcher.dispatch(
            &bob.conn_id,
            r#"{"type":"SESSION_INFO_REQUEST","sessionId":"AAAAAA"}"#,
        );
        match bob.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_notifies_web_peers_and_purges() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, Some(("alice", "a@example.com")));
        let mut web = connect(&dispatcher, None);
        let mut admin = connect(&dispatcher, Some(("alice", "a@example.com")));

        create_session(&dispatcher, &cli, "AAAAAA", &pk());
        cli.recv();
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"AAAAAA","publicKey":"{}"}}"#, pk()),
        );
        cli.recv();
        web.recv();

        dispatcher.dispatch(
            &admin.conn_id,
            r#"{"type":"SESSION_DELETE_REQUEST","sessionId":"AAAAAA"}"#,
        );
        assert!(matches!(web.recv(), ControlMessage::CliDisconnected));

        // Session gone for everyone.
        dispatcher.dispatch(
            &admin.conn_id,
            r#"{"type":"SESSION_INFO_REQUEST","sessionId":"AAAAAA"}"#,
        );
        match admin.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_disconnect_detaches_session() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let cli = connect(&dispatcher, None);
        let mut web = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        web.recv();

        dispatcher.connection_closed(&cli.conn_id);
        assert!(matches!(web.recv(), ControlMessage::CliDisconnected));
    }

    #[test]
    fn test_web_disconnect_notifies_cli() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);
        let web = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        cli.recv();
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        cli.recv();

        dispatcher.connection_closed(&web.conn_id);
        match cli.recv() {
            ControlMessage::WebDisconnected { connection_id } => {
                assert_eq!(connection_id, web.conn_id);
            }
            other => panic!("expected web:disconnected, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected_without_close() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut peer = connect(&dispatcher, None);

        let huge = format!(
            r#"{{"type":"PING","pad":"{}"}}"#,
            "x".repeat(crate::constants::MAX_FRAME_BYTES)
        );
        dispatcher.dispatch(&peer.conn_id, &huge);
        match peer.recv() {
            ControlMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("expected ERROR, got {other:?}"),
        }

        dispatcher.dispatch(&peer.conn_id, r#"{"type":"PING"}"#);
        assert!(matches!(peer.recv(), ControlMessage::Pong));
    }

    #[test]
    fn test_reconnect_pushes_cached_control_state() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let cli = connect(&dispatcher, None);
        let mut web = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        web.recv();

        dispatcher.connection_closed(&cli.conn_id);
        assert!(matches!(web.recv(), ControlMessage::CliDisconnected));

        // New transport, fresh key: anonymous session with an empty slot.
        let mut cli2 = connect(&dispatcher, None);
        dispatcher.dispatch(
            &cli2.conn_id,
            &format!(
                r#"{{"type":"SESSION_RECONNECT","sessionId":"ABCDEF","publicKey":"{}"}}"#,
                pk()
            ),
        );

        assert!(matches!(
            cli2.recv(),
            ControlMessage::SessionReconnected { .. }
        ));
        // CLI learns the surviving web peer, web peer learns the CLI is back.
        match cli2.recv() {
            ControlMessage::WebConnected { connection_id, .. } => {
                assert_eq!(connection_id, web.conn_id);
            }
            other => panic!("expected web:connected, got {other:?}"),
        }
        assert!(matches!(web.recv(), ControlMessage::CliConnected { .. }));
    }

    #[test]
    fn test_reconnect_with_new_key_purges_cache() {
        let dispatcher = Dispatcher::new("wss://relay.test/ws".into());
        let mut cli = connect(&dispatcher, None);

        create_session(&dispatcher, &cli, "ABCDEF", &pk());
        cli.recv();

        let envelope = r#"{"version":1,"sessionId":"ABCDEF","nonce":"bg==","ciphertext":"Yw==","timestamp":1}"#;
        dispatcher.dispatch(&cli.conn_id, envelope);

        dispatcher.connection_closed(&cli.conn_id);
        let mut cli2 = connect(&dispatcher, None);
        dispatcher.dispatch(
            &cli2.conn_id,
            &format!(
                r#"{{"type":"SESSION_RECONNECT","sessionId":"ABCDEF","publicKey":"{}"}}"#,
                pk()
            ),
        );
        cli2.recv();

        // Joining now replays nothing: the old-key ciphertext is gone.
        let mut web = connect(&dispatcher, None);
        dispatcher.dispatch(
            &web.conn_id,
            &format!(r#"{{"type":"SESSION_JOIN","sessionId":"ABCDEF","publicKey":"{}"}}"#, pk()),
        );
        cli2.recv();
        assert!(matches!(web.recv(), ControlMessage::CliConnected { .. }));
        assert!(web.no_pending());
    }
}
