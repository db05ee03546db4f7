// Library modules
pub mod auth;
pub mod commands;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod protocol;
pub mod pty;
pub mod query;
pub mod relay;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use envelope::{generate_session_id, CryptoError, KeyPair, SharedKey};
pub use protocol::{ControlMessage, Envelope, ErrorCode, Frame, Message, MessageKind};
pub use pty::{PtyEvent, PtyProcess, PtySpawnSpec};
pub use relay::{Dispatcher, RelayServer};
pub use session::{SessionConfig, SessionError, SessionEvent, SessionManager, SessionPhase};
