//! CLI session manager: owns the PTY and bridges it to the relay.
//!
//! # State machine
//!
//! ```text
//! IDLE → HANDSHAKING → READY → DETACHED → RECONNECTING → HANDSHAKING → READY
//!                          ↓                                              ↘
//!                        CLOSED                                         CLOSED
//! ```
//!
//! One task drives three concerns through a `select!` loop: PTY events
//! (fed by the adapter's reader thread), transport frames, and timers.
//! Only one transport is live at a time; on loss the manager detaches and
//! retries with exponential backoff while the PTY keeps running.
//!
//! Every web peer presents its own ephemeral key on join; output is
//! encrypted separately per peer under that peer's shared secret. The
//! key pair itself is immutable for the life of the manager, so a
//! transport-level reconnect does not invalidate peer secrets or the
//! relay's envelope cache.

pub mod filter;
pub mod outbound;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::constants::{
    HEARTBEAT_INTERVAL, MAX_DECRYPT_FAILURES, OUTPUT_CHUNK_BYTES, RECONNECT_INITIAL_DELAY,
    RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY,
};
use crate::envelope::{KeyPair, SharedKey};
use crate::protocol::{ControlMessage, Envelope, ErrorCode, Frame, Message, MessageKind};
use crate::pty::{PtyEvent, PtyProcess, PtySpawnSpec};
use crate::ws::{self, WsEvent, WsReader, WsWriter};

use filter::{FilterConfig, InputFilter};
use outbound::{OutboundQueue, ReplayBuffer};

/// How long to wait for the relay's handshake response.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle phase of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Keys generated, no transport.
    Idle,
    /// Transport open, awaiting `SESSION_CREATED`/`SESSION_RECONNECTED`.
    Handshaking,
    /// PTY live and bridged.
    Ready,
    /// Transport lost; PTY still running.
    Detached,
    /// Backoff elapsed, retrying the transport.
    Reconnecting,
    /// PTY killed, keys wiped. Terminal.
    Closed,
}

/// Terminal failure of a session.
#[derive(Debug)]
pub enum SessionError {
    /// The relay could not be reached at all.
    ServerUnreachable(String),
    /// The session does not exist (or expired).
    SessionNotFound,
    /// The relay refused the operation for this identity.
    Unauthorized,
    /// Create collided with an existing id; retry with a fresh one.
    SessionIdTaken,
    /// Handshake failed for another reason.
    HandshakeFailed(String),
    /// Reconnect attempts were exhausted.
    ReconnectExhausted,
    /// Local failure (PTY spawn, serialization).
    Internal(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerUnreachable(msg) => write!(f, "server unreachable: {msg}"),
            Self::SessionNotFound => write!(f, "session not found"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::SessionIdTaken => write!(f, "session id already in use"),
            Self::HandshakeFailed(msg) => write!(f, "handshake failed: {msg}"),
            Self::ReconnectExhausted => write!(f, "gave up reconnecting"),
            Self::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Events surfaced to the embedding command.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake completed; the session is reachable.
    Ready {
        session_id: String,
        ws_endpoint: String,
    },
    /// A web peer negotiated keys and was greeted.
    WebPeerConnected { connection_id: String },
    /// A web peer left.
    WebPeerDisconnected { connection_id: String },
    /// Transport lost; reconnect scheduled.
    Detached { attempt: u32, next_retry_ms: u64 },
    /// The PTY child exited.
    ChildExited { code: i32 },
}

/// Whether the manager creates a fresh session or rebinds an existing one.
#[derive(Debug, Clone)]
pub enum AttachMode {
    /// `SESSION_CREATE` with this metadata.
    Create,
    /// `SESSION_RECONNECT` to an existing session.
    Reconnect,
}

/// Everything needed to run a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint (`wss://...`).
    pub server: String,
    /// Bearer token, attached as a query parameter.
    pub token: Option<String>,
    /// Six-character session id.
    pub session_id: String,
    /// Create vs reconnect.
    pub mode: AttachMode,
    /// Instance label advertised on create.
    pub label: Option<String>,
    /// What to run in the PTY.
    pub spawn: PtySpawnSpec,
    /// Input filter configuration.
    pub filter: FilterConfig,
}

/// Per-web-peer state: the derived secret and a failure counter.
struct PeerState {
    key: SharedKey,
    decrypt_failures: u32,
}

/// How one transport attempt ended.
enum LoopExit {
    ChildExited(i32),
    Shutdown,
    TransportLost,
    Fatal(SessionError),
}

/// The CLI-side session driver.
pub struct SessionManager {
    config: SessionConfig,
    keys: KeyPair,
    phase: SessionPhase,
    peers: HashMap<String, PeerState>,
    seq: u64,
    outbound: OutboundQueue,
    replay: ReplayBuffer,
    filter: InputFilter,
    cols: u16,
    rows: u16,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_id", &self.config.session_id)
            .field("phase", &self.phase)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager in `IDLE` with a fresh key pair.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let filter = InputFilter::new(config.filter.clone());
        let cols = config.spawn.cols;
        let rows = config.spawn.rows;
        Self {
            config,
            keys: KeyPair::new(),
            phase: SessionPhase::Idle,
            peers: HashMap::new(),
            seq: 0,
            outbound: OutboundQueue::new(),
            replay: ReplayBuffer::default(),
            filter,
            cols,
            rows,
            events: None,
        }
    }

    /// Take the event stream. Call before [`run`](Self::run).
    pub fn events(&mut self) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Current phase (mainly for tests).
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Run the session to completion.
    ///
    /// Returns the PTY child's exit code on a clean end (0 when the
    /// shutdown flag ended the session first).
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] on handshake refusal, unreachable
    /// server, or exhausted reconnects.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<i32, SessionError> {
        let (mut pty, mut pty_rx) = PtyProcess::spawn(&self.config.spawn)
            .map_err(|e| SessionError::Internal(format!("PTY spawn failed: {e}")))?;
        log::info!(
            "Session {}: spawned `{}` (pid {:?})",
            self.config.session_id,
            self.config.spawn.command,
            pty.pid()
        );

        let mut first_attempt = true;
        let mut failures: u32 = 0;
        let mut delay = RECONNECT_INITIAL_DELAY;

        let result = loop {
            self.phase = if first_attempt {
                SessionPhase::Handshaking
            } else {
                SessionPhase::Reconnecting
            };

            match self
                .connect_and_run(&mut pty, &mut pty_rx, &shutdown, first_attempt)
                .await
            {
                LoopExit::ChildExited(code) => break Ok(code),
                LoopExit::Shutdown => break Ok(0),
                LoopExit::Fatal(err) => break Err(err),
                LoopExit::TransportLost => {
                    // A transport that had fully connected resets the
                    // backoff; only consecutive failures escalate it.
                    if self.phase == SessionPhase::Ready {
                        failures = 0;
                        delay = RECONNECT_INITIAL_DELAY;
                    }
                    failures += 1;
                    if failures > RECONNECT_MAX_ATTEMPTS {
                        log::error!(
                            "Session {}: giving up after {} reconnect attempts",
                            self.config.session_id,
                            RECONNECT_MAX_ATTEMPTS
                        );
                        break Err(SessionError::ReconnectExhausted);
                    }

                    self.phase = SessionPhase::Detached;
                    let wait_ms = delay.as_millis() as u64;
                    self.emit(SessionEvent::Detached {
                        attempt: failures,
                        next_retry_ms: wait_ms,
                    });
                    log::warn!(
                        "Session {}: transport lost, reconnecting in {:.1}s (attempt {}/{})",
                        self.config.session_id,
                        wait_ms as f32 / 1000.0,
                        failures,
                        RECONNECT_MAX_ATTEMPTS
                    );

                    if sleep_unless_shutdown(delay, &shutdown).await {
                        break Ok(0);
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }

            first_attempt = false;
        };

        self.close(&mut pty);
        result
    }

    /// One transport lifetime: connect, handshake, bridge until something
    /// ends it.
    async fn connect_and_run(
        &mut self,
        pty: &mut PtyProcess,
        pty_rx: &mut UnboundedReceiver<PtyEvent>,
        shutdown: &Arc<AtomicBool>,
        first_attempt: bool,
    ) -> LoopExit {
        let (mut writer, mut reader) =
            match ws::connect(&self.config.server, self.config.token.as_deref()).await {
                Ok(halves) => halves,
                Err(e) if first_attempt => {
                    return LoopExit::Fatal(SessionError::ServerUnreachable(e.to_string()));
                }
                Err(e) => {
                    log::warn!("Reconnect failed: {e}");
                    return LoopExit::TransportLost;
                }
            };

        self.phase = SessionPhase::Handshaking;
        if let Err(exit) = self
            .handshake(&mut writer, &mut reader, first_attempt)
            .await
        {
            return exit;
        }

        self.phase = SessionPhase::Ready;
        log::info!("Session {}: ready", self.config.session_id);

        // Anything buffered while detached goes out first.
        if self.flush(&mut writer).await.is_err() {
            return LoopExit::TransportLost;
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();
        let mut shutdown_poll = tokio::time::interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                _ = shutdown_poll.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        let _ = writer.send_close().await;
                        return LoopExit::Shutdown;
                    }
                }

                _ = heartbeat.tick() => {
                    let ping = Frame::Control(ControlMessage::Ping).encode();
                    if writer.send_frame(&ping).await.is_err() {
                        return LoopExit::TransportLost;
                    }
                }

                event = pty_rx.recv() => {
                    match event {
                        Some(PtyEvent::Data(bytes)) => {
                            self.handle_pty_output(&bytes);
                            if self.flush(&mut writer).await.is_err() {
                                return LoopExit::TransportLost;
                            }
                        }
                        Some(PtyEvent::Exit { code }) => {
                            log::info!(
                                "Session {}: child exited with {code}",
                                self.config.session_id
                            );
                            self.emit(SessionEvent::ChildExited { code });
                            let _ = self.flush(&mut writer).await;
                            let _ = writer.send_close().await;
                            return LoopExit::ChildExited(code);
                        }
                        None => {
                            // Reader thread gone without an exit event:
                            // treat as a clean end.
                            let _ = writer.send_close().await;
                            return LoopExit::ChildExited(0);
                        }
                    }
                }

                event = reader.recv() => {
                    match event {
                        Some(Ok(WsEvent::Frame(text))) => {
                            self.handle_frame(&text, pty);
                            if self.flush(&mut writer).await.is_err() {
                                return LoopExit::TransportLost;
                            }
                        }
                        Some(Ok(WsEvent::Closed { code })) => {
                            // 1000 is a deliberate close; anything else is
                            // a failure worth reconnecting through.
                            if code == 1000 {
                                log::info!("Relay closed transport normally");
                                return LoopExit::Shutdown;
                            }
                            log::info!("Relay closed transport (code {code})");
                            return LoopExit::TransportLost;
                        }
                        Some(Err(e)) => {
                            log::warn!("Transport read error: {e}");
                            return LoopExit::TransportLost;
                        }
                        None => return LoopExit::TransportLost,
                    }
                }
            }
        }
    }

    /// Send the create/reconnect request and await the relay's verdict.
    async fn handshake(
        &mut self,
        writer: &mut WsWriter,
        reader: &mut WsReader,
        first_attempt: bool,
    ) -> Result<(), LoopExit> {
        let request = match (&self.config.mode, first_attempt) {
            (AttachMode::Create, true) => ControlMessage::SessionCreate {
                session_id: self.config.session_id.clone(),
                public_key: self.keys.public_key(),
                command: Some(self.config.spawn.command.clone()),
                args: self.config.spawn.args.clone(),
                cwd: self.config.spawn.cwd.clone(),
                label: self.config.label.clone(),
            },
            // After the first success (and for `attach`), always rebind.
            _ => ControlMessage::SessionReconnect {
                session_id: self.config.session_id.clone(),
                public_key: self.keys.public_key(),
            },
        };

        if writer
            .send_frame(&Frame::Control(request).encode())
            .await
            .is_err()
        {
            return Err(LoopExit::TransportLost);
        }

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let msg = match tokio::time::timeout_at(deadline, reader.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    return Err(Self::handshake_failure(
                        first_attempt,
                        SessionError::HandshakeFailed("timed out".into()),
                    ));
                }
            };

            let text = match msg {
                Some(Ok(WsEvent::Frame(text))) => text,
                Some(Ok(WsEvent::Closed { .. })) | None => {
                    return Err(Self::handshake_failure(
                        first_attempt,
                        SessionError::HandshakeFailed("transport closed".into()),
                    ));
                }
                Some(Err(e)) => {
                    return Err(Self::handshake_failure(
                        first_attempt,
                        SessionError::HandshakeFailed(e.to_string()),
                    ));
                }
            };

            match Frame::parse(&text) {
                Ok(Frame::Control(ControlMessage::SessionCreated {
                    session_id,
                    ws_endpoint,
                }))
                | Ok(Frame::Control(ControlMessage::SessionReconnected {
                    session_id,
                    ws_endpoint,
                })) => {
                    self.emit(SessionEvent::Ready {
                        session_id,
                        ws_endpoint,
                    });
                    return Ok(());
                }
                Ok(Frame::Control(ControlMessage::Error { code, message })) => {
                    let err = match code {
                        ErrorCode::SessionNotFound | ErrorCode::SessionExpired => {
                            SessionError::SessionNotFound
                        }
                        ErrorCode::Unauthorized => SessionError::Unauthorized,
                        ErrorCode::SessionFull => SessionError::SessionIdTaken,
                        _ => SessionError::HandshakeFailed(message),
                    };
                    // Handshake refusals are authoritative; retrying the
                    // same request would get the same answer.
                    return Err(LoopExit::Fatal(err));
                }
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Unparseable frame during handshake: {e}");
                    continue;
                }
            }
        }
    }

    fn handshake_failure(first_attempt: bool, err: SessionError) -> LoopExit {
        if first_attempt {
            LoopExit::Fatal(err)
        } else {
            LoopExit::TransportLost
        }
    }

    // ── outbound path ─────────────────────────────────────────────────────

    /// Chunk, seal per peer, and queue a PTY output burst.
    fn handle_pty_output(&mut self, bytes: &[u8]) {
        self.replay.push(bytes);
        if self.peers.is_empty() {
            return;
        }

        for chunk in bytes.chunks(OUTPUT_CHUNK_BYTES) {
            let text = String::from_utf8_lossy(chunk);
            self.seq += 1;
            let message =
                Message::terminal_output(&text, self.seq, &self.config.session_id);

            for (conn_id, peer) in &self.peers {
                match peer.key.encrypt(&message, &self.config.session_id) {
                    Ok(envelope) => self.outbound.push(envelope, MessageKind::TerminalOutput),
                    Err(e) => log::error!("Encrypt for {conn_id} failed: {e}"),
                }
            }
        }
    }

    /// Drain the outbound queue onto the transport.
    async fn flush(&mut self, writer: &mut WsWriter) -> Result<(), ()> {
        while let Some(envelope) = self.outbound.pop() {
            let text = Frame::Envelope(envelope).encode();
            if writer.send_frame(&text).await.is_err() {
                return Err(());
            }
        }
        Ok(())
    }

    // ── inbound path ──────────────────────────────────────────────────────

    fn handle_frame(&mut self, text: &str, pty: &mut PtyProcess) {
        match Frame::parse(text) {
            Ok(Frame::Control(msg)) => self.handle_control(msg),
            Ok(Frame::Envelope(envelope)) => self.handle_envelope(&envelope, pty),
            Err(e) => log::warn!("Dropping unparseable frame: {e}"),
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::WebConnected {
                public_key,
                connection_id,
            } => match self.keys.establish(&public_key) {
                Ok(key) => {
                    log::info!("Web peer {connection_id} connected");
                    self.peers.insert(
                        connection_id.clone(),
                        PeerState {
                            key,
                            decrypt_failures: 0,
                        },
                    );
                    self.greet_peer(&connection_id);
                    self.emit(SessionEvent::WebPeerConnected { connection_id });
                }
                Err(e) => {
                    log::warn!("Rejecting web peer {connection_id}: {e}");
                }
            },

            ControlMessage::WebDisconnected { connection_id } => {
                if self.peers.remove(&connection_id).is_some() {
                    log::info!("Web peer {connection_id} disconnected");
                    self.emit(SessionEvent::WebPeerDisconnected { connection_id });
                }
            }

            ControlMessage::Pong => {}

            ControlMessage::Error { code, message } => {
                log::warn!("Relay error {code:?}: {message}");
            }

            other => {
                log::debug!("Ignoring control frame: {other:?}");
            }
        }
    }

    /// Fresh peer: send `STATE_SYNC`, then re-encrypt the replay buffer
    /// under its key. Relay-cached ciphertext was sealed for older keys
    /// and would be noise to this peer.
    fn greet_peer(&mut self, connection_id: &str) {
        let session_id = self.config.session_id.clone();

        self.seq += 1;
        let sync = Message {
            kind: MessageKind::StateSync,
            payload: json!({
                "cols": self.cols,
                "rows": self.rows,
                "outputHash": self.replay.content_hash(),
            }),
            seq: self.seq,
            session_id: Some(session_id.clone()),
        };
        self.seal_for_peer(connection_id, &sync, MessageKind::StateSync);

        let snapshot = self.replay.snapshot();
        for chunk in snapshot.chunks(OUTPUT_CHUNK_BYTES) {
            let text = String::from_utf8_lossy(chunk);
            self.seq += 1;
            let message = Message::terminal_output(&text, self.seq, &session_id);
            self.seal_for_peer(connection_id, &message, MessageKind::TerminalOutput);
        }
    }

    fn seal_for_peer(&mut self, connection_id: &str, message: &Message, kind: MessageKind) {
        let Some(peer) = self.peers.get(connection_id) else {
            return;
        };
        match peer.key.encrypt(message, &self.config.session_id) {
            Ok(envelope) => self.outbound.push(envelope, kind),
            Err(e) => log::error!("Encrypt for {connection_id} failed: {e}"),
        }
    }

    fn handle_envelope(&mut self, envelope: &Envelope, pty: &mut PtyProcess) {
        if envelope.session_id != self.config.session_id {
            log::warn!("Dropping envelope for session {}", envelope.session_id);
            return;
        }

        // No sender attribution on the wire: trial-decrypt against every
        // peer secret. The sealer's key opens it; any other fails the MAC.
        let mut opened: Option<(String, Message)> = None;
        for (conn_id, peer) in &self.peers {
            if let Ok(message) = peer.key.decrypt(envelope) {
                opened = Some((conn_id.clone(), message));
                break;
            }
        }

        match opened {
            Some((conn_id, message)) => {
                if let Some(peer) = self.peers.get_mut(&conn_id) {
                    peer.decrypt_failures = 0;
                }
                self.handle_inner(&conn_id, &message, pty);
            }
            None => {
                log::warn!("Envelope failed to decrypt under any peer key");
                let dropped: Vec<String> = self
                    .peers
                    .iter_mut()
                    .filter_map(|(conn_id, peer)| {
                        peer.decrypt_failures += 1;
                        (peer.decrypt_failures >= MAX_DECRYPT_FAILURES)
                            .then(|| conn_id.clone())
                    })
                    .collect();
                for conn_id in dropped {
                    log::error!(
                        "Removing web peer {conn_id} after {MAX_DECRYPT_FAILURES} consecutive decryption failures"
                    );
                    self.peers.remove(&conn_id);
                    self.emit(SessionEvent::WebPeerDisconnected {
                        connection_id: conn_id,
                    });
                }
            }
        }
    }

    fn handle_inner(&mut self, conn_id: &str, message: &Message, pty: &mut PtyProcess) {
        match message.kind {
            MessageKind::TerminalInput => {
                let Some(data) = message.payload.as_str() else {
                    log::warn!("TERMINAL_INPUT without string payload");
                    return;
                };
                let outcome = self.filter.filter(data.as_bytes());
                if !outcome.data.is_empty() {
                    if let Err(e) = pty.write_input(&outcome.data) {
                        log::error!("PTY write failed: {e}");
                    }
                }
                if outcome.blocked {
                    self.seq += 1;
                    let diagnostic = Message {
                        kind: MessageKind::BlockedSignal,
                        payload: json!({ "signals": outcome.blocked_signals }),
                        seq: self.seq,
                        session_id: Some(self.config.session_id.clone()),
                    };
                    self.seal_for_peer(conn_id, &diagnostic, MessageKind::BlockedSignal);
                }
            }

            MessageKind::TerminalResize => {
                let cols = message.payload.get("cols").and_then(serde_json::Value::as_u64);
                let rows = message.payload.get("rows").and_then(serde_json::Value::as_u64);
                if let (Some(cols), Some(rows)) = (cols, rows) {
                    log::info!("Resize to {cols}x{rows}");
                    self.cols = cols as u16;
                    self.rows = rows as u16;
                    pty.resize(self.cols, self.rows);
                }
            }

            other => {
                log::debug!("Ignoring inner message kind {other:?} from {conn_id}");
            }
        }
    }

    // ── teardown ──────────────────────────────────────────────────────────

    /// Kill the PTY, discard pending output, wipe peer secrets.
    fn close(&mut self, pty: &mut PtyProcess) {
        self.phase = SessionPhase::Closed;
        self.outbound.clear();
        // SharedKey zeroizes on drop.
        self.peers.clear();
        pty.kill();
        log::info!("Session {} closed", self.config.session_id);
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Sleep for `delay`, returning early (true) if the shutdown flag rises.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &Arc<AtomicBool>) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        let step = Duration::from_millis(100).min(deadline - now);
        tokio::time::sleep(step).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            server: "ws://127.0.0.1:1/ws".into(),
            token: None,
            session_id: "ABCDEF".into(),
            mode: AttachMode::Create,
            label: None,
            spawn: PtySpawnSpec {
                command: "cat".into(),
                args: Vec::new(),
                cwd: None,
                env: HashMap::new(),
                cols: 80,
                rows: 24,
                daemon: false,
            },
            filter: FilterConfig::default(),
        }
    }

    #[test]
    fn test_new_manager_is_idle() {
        let manager = SessionManager::new(config());
        assert_eq!(manager.phase(), SessionPhase::Idle);
        assert_eq!(manager.seq, 0);
        assert!(manager.peers.is_empty());
    }

    #[test]
    fn test_pty_output_without_peers_only_buffers() {
        let mut manager = SessionManager::new(config());
        manager.handle_pty_output(b"early output\n");
        assert!(manager.outbound.is_empty());
        assert_eq!(manager.replay.snapshot(), b"early output\n");
    }

    #[test]
    fn test_pty_output_sealed_once_per_peer() {
        let mut manager = SessionManager::new(config());
        let web_a = KeyPair::new();
        let web_b = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web_a.public_key(),
            connection_id: "c-2".into(),
        });
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web_b.public_key(),
            connection_id: "c-3".into(),
        });
        // Greeting: one STATE_SYNC per peer (replay buffer is empty).
        assert_eq!(manager.outbound.len(), 2);

        manager.handle_pty_output(b"a.txt\n");
        assert_eq!(manager.outbound.len(), 4);

        // Both peers can open their copy; seq matches for the same burst.
        let cli_pub = manager.keys.public_key();
        let mut outputs = Vec::new();
        while let Some(envelope) = manager.outbound.pop() {
            for (web, _name) in [(&web_a, "a"), (&web_b, "b")] {
                let key = web.establish(&cli_pub).unwrap();
                if let Ok(message) = key.decrypt(&envelope) {
                    if message.kind == MessageKind::TerminalOutput {
                        outputs.push(message);
                    }
                }
            }
        }
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].payload.as_str(), Some("a.txt\n"));
        assert_eq!(outputs[0].seq, outputs[1].seq);
    }

    #[test]
    fn test_web_peer_greeted_with_state_sync() {
        let mut manager = SessionManager::new(config());
        manager.handle_pty_output(b"before join\n");

        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });

        let key = web.establish(&manager.keys.public_key()).unwrap();
        let sync = key.decrypt(&manager.outbound.pop().unwrap()).unwrap();
        assert_eq!(sync.kind, MessageKind::StateSync);
        assert_eq!(sync.payload.get("cols").unwrap(), 80);
        assert_eq!(sync.payload.get("rows").unwrap(), 24);
        assert!(sync.payload.get("outputHash").unwrap().is_string());

        // Replay of pre-join output, re-encrypted for this peer.
        let replayed = key.decrypt(&manager.outbound.pop().unwrap()).unwrap();
        assert_eq!(replayed.kind, MessageKind::TerminalOutput);
        assert_eq!(replayed.payload.as_str(), Some("before join\n"));
        assert!(replayed.seq > sync.seq);
    }

    #[test]
    fn test_bad_peer_key_rejected() {
        let mut manager = SessionManager::new(config());
        manager.handle_control(ControlMessage::WebConnected {
            public_key: "bm90LWEta2V5".into(),
            connection_id: "c-2".into(),
        });
        assert!(manager.peers.is_empty());
        assert!(manager.outbound.is_empty());
    }

    #[test]
    fn test_web_disconnect_removes_secret() {
        let mut manager = SessionManager::new(config());
        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        assert_eq!(manager.peers.len(), 1);

        manager.handle_control(ControlMessage::WebDisconnected {
            connection_id: "c-2".into(),
        });
        assert!(manager.peers.is_empty());
    }

    #[tokio::test]
    async fn test_input_filtered_before_pty() {
        let mut manager = SessionManager::new(config());
        let (mut pty, mut pty_rx) = PtyProcess::spawn(&config().spawn).unwrap();

        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        let key = web.establish(&manager.keys.public_key()).unwrap();
        while manager.outbound.pop().is_some() {}

        // "hello\x03world" → PTY sees "helloworld", peer gets BLOCKED_SIGNAL.
        let input = Message::terminal_input("hello\u{3}world", 1, "ABCDEF");
        let envelope = key.encrypt(&input, "ABCDEF").unwrap();
        manager.handle_envelope(&envelope, &mut pty);

        let diagnostic = key.decrypt(&manager.outbound.pop().unwrap()).unwrap();
        assert_eq!(diagnostic.kind, MessageKind::BlockedSignal);
        assert_eq!(
            diagnostic.payload.get("signals").unwrap(),
            &json!(["SIGINT"])
        );

        // cat echoes what it was given.
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), pty_rx.recv()).await
        {
            if let PtyEvent::Data(bytes) = event {
                seen.extend_from_slice(&bytes);
                if String::from_utf8_lossy(&seen).contains("helloworld") {
                    break;
                }
            }
        }
        let text = String::from_utf8_lossy(&seen);
        assert!(text.contains("helloworld"), "PTY saw: {text:?}");
        assert!(!seen.contains(&0x03), "Ctrl-C reached the PTY");

        pty.kill();
    }

    #[tokio::test]
    async fn test_resize_updates_dimensions() {
        let mut manager = SessionManager::new(config());
        let (mut pty, _pty_rx) = PtyProcess::spawn(&config().spawn).unwrap();

        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        let key = web.establish(&manager.keys.public_key()).unwrap();

        let resize = Message {
            kind: MessageKind::TerminalResize,
            payload: json!({"cols": 132, "rows": 43}),
            seq: 1,
            session_id: Some("ABCDEF".into()),
        };
        let envelope = key.encrypt(&resize, "ABCDEF").unwrap();
        manager.handle_envelope(&envelope, &mut pty);

        assert_eq!(manager.cols, 132);
        assert_eq!(manager.rows, 43);
        pty.kill();
    }

    #[tokio::test]
    async fn test_five_decrypt_failures_remove_peer() {
        let mut manager = SessionManager::new(config());
        let (mut pty, _pty_rx) = PtyProcess::spawn(&config().spawn).unwrap();

        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        let key = web.establish(&manager.keys.public_key()).unwrap();

        // A tampered envelope fails the MAC every time.
        let input = Message::terminal_input("x", 1, "ABCDEF");
        let mut envelope = key.encrypt(&input, "ABCDEF").unwrap();
        envelope.ciphertext = format!("AAAA{}", &envelope.ciphertext[4..]);

        for _ in 0..MAX_DECRYPT_FAILURES {
            manager.handle_envelope(&envelope, &mut pty);
        }
        assert!(manager.peers.is_empty(), "peer should be removed");

        pty.kill();
    }

    #[tokio::test]
    async fn test_good_envelope_resets_failure_count() {
        let mut manager = SessionManager::new(config());
        let (mut pty, _pty_rx) = PtyProcess::spawn(&config().spawn).unwrap();

        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        let key = web.establish(&manager.keys.public_key()).unwrap();

        let input = Message::terminal_input("ok\n", 1, "ABCDEF");
        let good = key.encrypt(&input, "ABCDEF").unwrap();
        let mut bad = key.encrypt(&input, "ABCDEF").unwrap();
        bad.ciphertext = format!("AAAA{}", &bad.ciphertext[4..]);

        for _ in 0..MAX_DECRYPT_FAILURES - 1 {
            manager.handle_envelope(&bad, &mut pty);
        }
        manager.handle_envelope(&good, &mut pty);
        for _ in 0..MAX_DECRYPT_FAILURES - 1 {
            manager.handle_envelope(&bad, &mut pty);
        }
        assert_eq!(manager.peers.len(), 1, "reset counter must spare the peer");

        pty.kill();
    }

    #[test]
    fn test_large_output_chunked() {
        let mut manager = SessionManager::new(config());
        let web = KeyPair::new();
        manager.handle_control(ControlMessage::WebConnected {
            public_key: web.public_key(),
            connection_id: "c-2".into(),
        });
        while manager.outbound.pop().is_some() {}

        let big = vec![b'x'; OUTPUT_CHUNK_BYTES + 1];
        manager.handle_pty_output(&big);
        assert_eq!(manager.outbound.len(), 2);

        // Every encoded frame stays under the transport cap.
        while let Some(envelope) = manager.outbound.pop() {
            let encoded = Frame::Envelope(envelope).encode();
            assert!(encoded.len() <= crate::constants::MAX_FRAME_BYTES);
        }
    }

    #[tokio::test]
    async fn test_run_unreachable_server_is_fatal() {
        let manager = SessionManager::new(config());
        let shutdown = Arc::new(AtomicBool::new(false));
        match manager.run(shutdown).await {
            Err(SessionError::ServerUnreachable(_)) => {}
            other => panic!("expected ServerUnreachable, got {other:?}"),
        }
    }
}
