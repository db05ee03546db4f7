//! Authoritative session records with TTL and ownership.
//!
//! The store owns every `Session`; the registry owns connections; dispatch
//! coordinates the two. Every mutating operation refreshes the session's
//! TTL (24 h from last activity). Expired records are dropped lazily on
//! access and by the background sweeper.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::constants::SESSION_TTL;
use crate::protocol::{ErrorCode, SessionState, SessionSummary};

/// Owner id recorded for unauthenticated sessions.
///
/// No ownership check can ever match it, so anonymous sessions are only
/// reachable through the transport that created them.
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Session store operation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Create collided with an existing id.
    SessionExists,
    /// No record with that id.
    NotFound,
    /// The record's TTL elapsed.
    Expired,
    /// Caller does not own the session.
    Unauthorized,
    /// The session cannot accept peers in its current state.
    Closed,
}

impl StoreError {
    /// The wire error code this failure maps to.
    #[must_use]
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::SessionExists => ErrorCode::SessionFull,
            Self::NotFound => ErrorCode::SessionNotFound,
            Self::Expired => ErrorCode::SessionExpired,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::Closed => ErrorCode::SessionNotFound,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionExists => write!(f, "session id already in use"),
            Self::NotFound => write!(f, "session not found"),
            Self::Expired => write!(f, "session expired"),
            Self::Unauthorized => write!(f, "not the session owner"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Creation-time metadata for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    /// Command the host runs.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Working-directory hint.
    pub cwd: Option<String>,
    /// Instance label.
    pub label: Option<String>,
}

/// One authoritative session record.
#[derive(Debug, Clone)]
pub struct Session {
    /// Six-character id.
    pub id: String,
    /// Owning user id ([`ANONYMOUS_OWNER`] when unauthenticated).
    pub owner: String,
    /// Current CLI public key; web peers negotiate against this.
    pub cli_public_key: String,
    /// Bound CLI connection, if attached.
    pub cli_conn: Option<String>,
    /// Attached web peers, join order.
    pub web_peers: Vec<WebPeer>,
    /// Command metadata.
    pub meta: SessionMeta,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity (drives the TTL).
    pub last_active_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: SessionState,
}

impl Session {
    /// Render the record for list/info responses.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            state: self.state,
            command: self.meta.command.clone(),
            args: self.meta.args.clone(),
            cwd: self.meta.cwd.clone(),
            label: self.meta.label.clone(),
            owner: self.owner.clone(),
            web_peers: self.web_peers.len(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = ChronoDuration::from_std(SESSION_TTL).expect("session TTL fits chrono range");
        now - self.last_active_at > ttl
    }

    fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

/// Outcome of a reconnect: whether the CLI public key changed.
///
/// A rotated key invalidates relay-cached ciphertext; dispatch purges the
/// cache when this is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub key_rotated: bool,
}

/// In-memory map of session id → record.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to a CLI connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionExists`] when the id is already live.
    pub fn create(
        &mut self,
        id: &str,
        owner: Option<&str>,
        cli_public_key: &str,
        cli_conn: &str,
        meta: SessionMeta,
    ) -> Result<&Session, StoreError> {
        self.drop_if_expired(id);
        if self.sessions.contains_key(id) {
            return Err(StoreError::SessionExists);
        }

        let now = Utc::now();
        let session = Session {
            id: id.to_string(),
            owner: owner.unwrap_or(ANONYMOUS_OWNER).to_string(),
            cli_public_key: cli_public_key.to_string(),
            cli_conn: Some(cli_conn.to_string()),
            web_peers: Vec::new(),
            meta,
            created_at: now,
            last_active_at: now,
            state: SessionState::Active,
        };
        Ok(self.sessions.entry(id.to_string()).or_insert(session))
    }

    /// Rebind the CLI slot after a disconnect.
    ///
    /// Owned sessions admit only their owner — even into an empty slot, a
    /// different authenticated user is refused. Anonymous sessions admit
    /// any caller while the slot is empty. A matching owner may also take
    /// over an occupied slot (the old transport is about to be dropped).
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`Expired` for missing sessions and
    /// `Unauthorized` when the caller may not bind.
    pub fn reconnect_cli(
        &mut self,
        id: &str,
        caller: Option<&str>,
        new_public_key: &str,
        new_cli_conn: &str,
    ) -> Result<ReconnectOutcome, StoreError> {
        let session = self.get_mut(id)?;

        let slot_empty = session.cli_conn.is_none();
        let owner_matches = caller == Some(session.owner.as_str());
        let allowed = if session.owner == ANONYMOUS_OWNER {
            slot_empty
        } else {
            owner_matches
        };
        if !allowed {
            return Err(StoreError::Unauthorized);
        }

        let key_rotated = session.cli_public_key != new_public_key;
        session.cli_public_key = new_public_key.to_string();
        session.cli_conn = Some(new_cli_conn.to_string());
        session.state = SessionState::Active;
        session.touch();

        Ok(ReconnectOutcome { key_rotated })
    }

    /// Attach a web peer with its ephemeral public key.
    ///
    /// The key is kept so a reconnecting CLI can be told whom to
    /// renegotiate with.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`Expired` for missing sessions and `Closed`
    /// when the session no longer accepts peers.
    pub fn join_web(
        &mut self,
        id: &str,
        web_public_key: &str,
        web_conn: &str,
    ) -> Result<&Session, StoreError> {
        let session = self.get_mut(id)?;
        if session.state == SessionState::Closed {
            return Err(StoreError::Closed);
        }
        if !session.web_peers.iter().any(|p| p.conn == web_conn) {
            session.web_peers.push(WebPeer {
                conn: web_conn.to_string(),
                public_key: web_public_key.to_string(),
            });
        }
        session.touch();
        Ok(session)
    }

    /// Detach a connection from whichever slot holds it.
    ///
    /// A departing CLI moves the session to `cli-detached`, preserving web
    /// peers. Returns the role that was removed, if any.
    pub fn leave(&mut self, id: &str, conn: &str) -> Option<DetachedRole> {
        let session = self.sessions.get_mut(id)?;
        if session.cli_conn.as_deref() == Some(conn) {
            session.cli_conn = None;
            session.state = SessionState::CliDetached;
            session.touch();
            return Some(DetachedRole::Cli);
        }
        let before = session.web_peers.len();
        session.web_peers.retain(|p| p.conn != conn);
        if session.web_peers.len() != before {
            session.touch();
            return Some(DetachedRole::Web);
        }
        None
    }

    /// Unbind the CLI slot, preserving web peers.
    pub fn detach_cli(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.cli_conn = None;
            session.state = SessionState::CliDetached;
            session.touch();
        }
    }

    /// Apply an owner-only metadata patch.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless the caller is the session owner.
    pub fn update(
        &mut self,
        id: &str,
        caller: Option<&str>,
        label: Option<String>,
    ) -> Result<&Session, StoreError> {
        let session = self.get_mut(id)?;
        if caller != Some(session.owner.as_str()) {
            return Err(StoreError::Unauthorized);
        }
        if let Some(label) = label {
            session.meta.label = Some(label);
        }
        session.touch();
        Ok(session)
    }

    /// Remove a session permanently (owner-only, final).
    ///
    /// Returns the removed record so dispatch can notify its peers.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` unless the caller is the session owner.
    pub fn delete(&mut self, id: &str, caller: Option<&str>) -> Result<Session, StoreError> {
        let session = self.get(id)?;
        if caller != Some(session.owner.as_str()) {
            return Err(StoreError::Unauthorized);
        }
        let mut removed = self
            .sessions
            .remove(id)
            .expect("record present after get");
        removed.state = SessionState::Closed;
        Ok(removed)
    }

    /// Sessions owned by `user`, active first.
    ///
    /// `include_inactive` also returns `cli-detached` sessions.
    #[must_use]
    pub fn list(&mut self, user: &str, include_inactive: bool) -> Vec<&Session> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.expired(Utc::now()))
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            self.sessions.remove(&id);
        }

        let mut sessions: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.owner == user)
            .filter(|s| include_inactive || s.state == SessionState::Active)
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_active_at));
        sessions
    }

    /// Look up a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Expired`.
    pub fn get(&mut self, id: &str) -> Result<&Session, StoreError> {
        if self.drop_if_expired(id) {
            return Err(StoreError::Expired);
        }
        self.sessions.get(id).ok_or(StoreError::NotFound)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Session, StoreError> {
        if self.drop_if_expired(id) {
            return Err(StoreError::Expired);
        }
        self.sessions.get_mut(id).ok_or(StoreError::NotFound)
    }

    /// Remove the record if its TTL elapsed. Returns true when dropped.
    fn drop_if_expired(&mut self, id: &str) -> bool {
        let expired = self
            .sessions
            .get(id)
            .is_some_and(|s| s.expired(Utc::now()));
        if expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Drop every expired record, returning their ids (for the sweeper).
    pub fn purge_expired(&mut self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.expired(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    fn backdate(&mut self, id: &str, age: ChronoDuration) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.last_active_at = Utc::now() - age;
        }
    }
}

/// Role removed by [`SessionStore::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachedRole {
    Cli,
    Web,
}

/// An attached web peer: connection id plus its ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebPeer {
    /// Relay connection id.
    pub conn: String,
    /// Base64 X25519 public key presented on join.
    pub public_key: String,
}
