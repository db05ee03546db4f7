//! The session relay: a WebSocket server that routes control frames and
//! opaque encrypted envelopes between a CLI host and its web peers.
//!
//! # Architecture
//!
//! ```text
//! RelayServer (accept loop, per-connection tasks, sweeper)
//!     └── Dispatcher (one call per inbound frame)
//!             ├── ConnectionRegistry  connection ↔ session ↔ role
//!             ├── SessionStore        authoritative records, TTL, ownership
//!             └── MessageCache        bounded replay ring per session
//! ```
//!
//! The relay never decrypts: payload-carrying frames are routed purely by
//! their cleartext session id and the sender's role.

pub mod cache;
pub mod dispatch;
pub mod registry;
pub mod server;
pub mod store;

pub use cache::MessageCache;
pub use dispatch::{Dispatcher, RelayState};
pub use registry::{ConnectionRegistry, ConnectionRecord, Role};
pub use server::RelayServer;
pub use store::{Session, SessionMeta, SessionStore, StoreError, ANONYMOUS_OWNER};
