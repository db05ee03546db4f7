//! Connection registry: live transport attachments and their liveness.
//!
//! Every accepted transport gets a record here, a generated connection id,
//! and an outbound channel. Frames queued on that channel are written by
//! the connection's writer task, which gives per-peer FIFO ordering for
//! free. Dropping the record's sender ends the writer task and closes the
//! socket, so eviction and disconnect share one path.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;

use crate::auth::AuthUser;
use crate::constants::HEARTBEAT_TIMEOUT;

/// Role a connection plays once bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Cli,
    Web,
}

/// One live transport attachment.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Relay-assigned connection id (`c-1`, `c-2`, ...).
    pub id: String,
    /// Session this connection is bound to (None until the first
    /// create/reconnect/join).
    pub session_id: Option<String>,
    /// Role within the session, set when bound.
    pub role: Option<Role>,
    /// Authenticated identity, if a valid token was presented.
    pub user: Option<AuthUser>,
    /// Last inbound frame time.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Outbound frame queue (text frames, FIFO per peer).
    sender: UnboundedSender<String>,
}

/// Generate the next connection id.
fn next_conn_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("c-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Map of connection id → record.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, ConnectionRecord>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted transport; returns its connection id.
    pub fn register(&mut self, user: Option<AuthUser>, sender: UnboundedSender<String>) -> String {
        let id = next_conn_id();
        self.connections.insert(
            id.clone(),
            ConnectionRecord {
                id: id.clone(),
                session_id: None,
                role: None,
                user,
                last_heartbeat_at: Utc::now(),
                sender,
            },
        );
        id
    }

    /// Bind a connection to a session with a role.
    pub fn bind(&mut self, conn_id: &str, session_id: &str, role: Role) {
        if let Some(record) = self.connections.get_mut(conn_id) {
            record.session_id = Some(session_id.to_string());
            record.role = Some(role);
        }
    }

    /// Clear a connection's session binding (session was deleted).
    pub fn bind_cleared(&mut self, conn_id: &str) {
        if let Some(record) = self.connections.get_mut(conn_id) {
            record.session_id = None;
            record.role = None;
        }
    }

    /// Record an inbound frame for liveness.
    pub fn heartbeat(&mut self, conn_id: &str) {
        if let Some(record) = self.connections.get_mut(conn_id) {
            record.last_heartbeat_at = Utc::now();
        }
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, conn_id: &str) -> Option<&ConnectionRecord> {
        self.connections.get(conn_id)
    }

    /// Queue a frame for a connection. Best-effort: a closed or missing
    /// peer returns false and is otherwise ignored.
    pub fn send_to(&self, conn_id: &str, frame: &str) -> bool {
        match self.connections.get(conn_id) {
            Some(record) => record.sender.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    /// Remove a connection, returning its record.
    pub fn remove(&mut self, conn_id: &str) -> Option<ConnectionRecord> {
        self.connections.remove(conn_id)
    }

    /// Evict connections whose last heartbeat is older than the timeout.
    ///
    /// Dropping the returned records closes their sockets; callers surface
    /// each eviction as a normal disconnect.
    pub fn sweep(&mut self) -> Vec<ConnectionRecord> {
        let now = Utc::now();
        let timeout =
            ChronoDuration::from_std(HEARTBEAT_TIMEOUT).expect("timeout fits chrono range");
        let stale: Vec<String> = self
            .connections
            .values()
            .filter(|r| now - r.last_heartbeat_at > timeout)
            .map(|r| r.id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| self.connections.remove(id))
            .collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[cfg(test)]
    fn backdate(&mut self, conn_id: &str, age: ChronoDuration) {
        if let Some(record) = self.connections.get_mut(conn_id) {
            record.last_heartbeat_at = Utc::now() - age;
        }
    }
}
