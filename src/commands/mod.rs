//! CLI subcommand implementations.
//!
//! Each function returns the process exit code; `main` hands it straight
//! to `std::process::exit`. The codes are part of the CLI contract:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | generic error |
//! | 2 | usage (owned by clap) |
//! | 3 | authentication required |
//! | 4 | server unreachable |
//! | 5 | session not found |
//! | child's code | PTY child exited non-zero in the foreground |

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;

use crate::auth;
use crate::config::{self, Config};
use crate::envelope::generate_session_id;
use crate::protocol::{ErrorCode, SessionState, SessionSummary};
use crate::pty::PtySpawnSpec;
use crate::query::{self, QueryError};
use crate::session::filter::FilterConfig;
use crate::session::{
    AttachMode, SessionConfig, SessionError, SessionEvent, SessionManager,
};
use crate::ws::to_relay_scheme;

/// Generic failure.
pub const EXIT_ERROR: i32 = 1;
/// A bearer token is required and missing or rejected.
pub const EXIT_AUTH_REQUIRED: i32 = 3;
/// The relay could not be reached.
pub const EXIT_UNREACHABLE: i32 = 4;
/// The named session does not exist (or is not yours).
pub const EXIT_SESSION_NOT_FOUND: i32 = 5;

/// `login [--web-url <url>] [--token <token>]`
pub fn login(web_url: Option<String>, token: Option<String>) -> i32 {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return EXIT_ERROR;
        }
    };

    let web_url = match web_url.or_else(|| {
        if config.web_url.is_empty() {
            None
        } else {
            Some(config.web_url.clone())
        }
    }) {
        Some(url) => url,
        None => {
            eprintln!("No web URL configured. Run: always-coder login --web-url <url>");
            return EXIT_ERROR;
        }
    };

    match auth::login(&mut config, &web_url, token) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Login failed: {e}");
            if e.to_string().contains("unreachable") || e.to_string().contains("Failed to reach") {
                EXIT_UNREACHABLE
            } else {
                EXIT_ERROR
            }
        }
    }
}

/// `logout`
pub fn logout() -> i32 {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return EXIT_ERROR;
        }
    };
    config.clear_auth();
    match config.save() {
        Ok(()) => {
            println!("Logged out.");
            0
        }
        Err(e) => {
            eprintln!("Failed to save config: {e}");
            EXIT_ERROR
        }
    }
}

/// `config get <key>` / `config set <key> <value>` / `config unset <key>`
pub fn config_cmd(action: &str, key: &str, value: Option<&str>) -> i32 {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return EXIT_ERROR;
        }
    };

    let result = match (action, value) {
        ("get", _) => match config.get_key(key) {
            Ok(Some(value)) => {
                println!("{value}");
                return 0;
            }
            Ok(None) => {
                println!();
                return 0;
            }
            Err(e) => Err(e),
        },
        ("set", Some(value)) => config.set_key(key, value).and_then(|()| config.save()),
        ("unset", _) => config.unset_key(key).and_then(|()| config.save()),
        _ => {
            eprintln!("config set requires a value");
            return EXIT_ERROR;
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            EXIT_ERROR
        }
    }
}

/// `run -- <command> [args...]`: create a session and bridge it.
pub async fn run(
    command: Vec<String>,
    label: Option<String>,
    shutdown: Arc<AtomicBool>,
) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return EXIT_ERROR;
        }
    };
    if config.server.is_empty() {
        eprintln!("No relay configured. Run `always-coder login` or `always-coder config set server wss://...`");
        return EXIT_ERROR;
    }

    let (program, args) = match command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => {
            eprintln!("No command given. Usage: always-coder run -- <command> [args...]");
            return EXIT_ERROR;
        }
    };

    let label = Some(label.unwrap_or_else(|| config.label()));
    let spawn = spawn_spec(&program, args);

    // Collisions are possible with 6-character ids; retry with fresh ones.
    for _ in 0..3 {
        let session_id = generate_session_id();
        let session_config = SessionConfig {
            server: config.server.clone(),
            token: config.auth_token.clone(),
            session_id: session_id.clone(),
            mode: AttachMode::Create,
            label: label.clone(),
            spawn: spawn.clone(),
            filter: FilterConfig::default(),
        };

        match drive_session(session_config, &config, Arc::clone(&shutdown)).await {
            Ok(code) => return code,
            Err(SessionError::SessionIdTaken) => {
                log::info!("Session id {session_id} taken, retrying");
            }
            Err(err) => return session_error_code(&err),
        }
    }

    eprintln!("Could not allocate a session id");
    EXIT_ERROR
}

/// `attach <sessionId>`: rebind an existing session with a fresh PTY.
pub async fn attach(
    session_id: String,
    command: Vec<String>,
    shutdown: Arc<AtomicBool>,
) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return EXIT_ERROR;
        }
    };
    if config.server.is_empty() {
        eprintln!("No relay configured. Run `always-coder login` first.");
        return EXIT_ERROR;
    }

    // Recover the original command from the relay when we can (owned
    // sessions only); otherwise fall back to an explicit or default shell.
    let (program, args) = if let Some((program, args)) = command.split_first() {
        (program.clone(), args.to_vec())
    } else if let Some(token) = config.auth_token.as_deref() {
        match query::session_info(&to_relay_scheme(&config.server), token, &session_id).await {
            Ok(info) if !info.command.is_empty() => (info.command, info.args),
            _ => (default_shell(), Vec::new()),
        }
    } else {
        (default_shell(), Vec::new())
    };

    let session_config = SessionConfig {
        server: config.server.clone(),
        token: config.auth_token.clone(),
        session_id,
        mode: AttachMode::Reconnect,
        label: None,
        spawn: spawn_spec(&program, args),
        filter: FilterConfig::default(),
    };

    match drive_session(session_config, &config, shutdown).await {
        Ok(code) => code,
        Err(err) => session_error_code(&err),
    }
}

/// `list [--all]`
pub async fn list(all: bool) -> i32 {
    let (server, token) = match query_target() {
        Ok(target) => target,
        Err(code) => return code,
    };

    match query::list_sessions(&server, &token, all).await {
        Ok(sessions) => {
            if sessions.is_empty() {
                println!("No sessions.");
                return 0;
            }
            println!(
                "{:<8} {:<13} {:<20} {:<16} {:>5}  {}",
                "ID", "STATE", "COMMAND", "LABEL", "PEERS", "ACTIVE"
            );
            for session in sessions {
                println!("{}", format_row(&session));
            }
            0
        }
        Err(err) => query_error_code(&err),
    }
}

/// `info <sessionId>`
pub async fn info(session_id: String) -> i32 {
    let (server, token) = match query_target() {
        Ok(target) => target,
        Err(code) => return code,
    };

    match query::session_info(&server, &token, &session_id).await {
        Ok(session) => {
            println!("Session:  {}", session.session_id);
            println!("State:    {}", state_name(session.state));
            println!(
                "Command:  {} {}",
                session.command,
                session.args.join(" ")
            );
            if let Some(cwd) = &session.cwd {
                println!("Cwd:      {cwd}");
            }
            if let Some(label) = &session.label {
                println!("Label:    {label}");
            }
            println!("Owner:    {}", session.owner);
            println!("Peers:    {}", session.web_peers);
            println!("Created:  {}", session.created_at.to_rfc3339());
            println!("Active:   {}", session.last_active_at.to_rfc3339());
            0
        }
        Err(err) => query_error_code(&err),
    }
}

/// `delete <sessionId>`
pub async fn delete(session_id: String) -> i32 {
    let (server, token) = match query_target() {
        Ok(target) => target,
        Err(code) => return code,
    };

    match query::delete_session(&server, &token, &session_id).await {
        Ok(()) => {
            println!("Session {session_id} deleted.");
            0
        }
        Err(err) => query_error_code(&err),
    }
}

// ── helpers ───────────────────────────────────────────────────────────────

/// Run a session manager, printing its lifecycle events.
async fn drive_session(
    session_config: SessionConfig,
    config: &Config,
    shutdown: Arc<AtomicBool>,
) -> Result<i32, SessionError> {
    let mut manager = SessionManager::new(session_config);
    let mut events = manager.events();

    let web_url = config.web_url.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Ready { session_id, .. } => {
                    println!("Session {session_id} is live.");
                    if !web_url.is_empty() {
                        println!("Open {web_url}/terminal/{session_id} to connect.");
                    }
                }
                SessionEvent::WebPeerConnected { connection_id } => {
                    println!("Web peer connected ({connection_id}).");
                }
                SessionEvent::WebPeerDisconnected { connection_id } => {
                    println!("Web peer disconnected ({connection_id}).");
                }
                SessionEvent::Detached {
                    attempt,
                    next_retry_ms,
                } => {
                    println!(
                        "Connection lost; retrying in {:.1}s (attempt {attempt}).",
                        next_retry_ms as f32 / 1000.0
                    );
                }
                SessionEvent::ChildExited { code } => {
                    println!("Command exited with code {code}.");
                }
            }
        }
    });

    let result = manager.run(shutdown).await;
    printer.abort();
    result
}

fn spawn_spec(program: &str, args: Vec<String>) -> PtySpawnSpec {
    PtySpawnSpec {
        command: program.to_string(),
        args,
        cwd: std::env::current_dir()
            .ok()
            .map(|p| p.to_string_lossy().into_owned()),
        env: HashMap::new(),
        cols: 80,
        rows: 24,
        daemon: config::daemon_mode(),
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
}

/// Resolve (relay URL, token) for an administrative query.
fn query_target() -> Result<(String, String), i32> {
    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load config: {e}");
        EXIT_ERROR
    })?;
    if config.server.is_empty() {
        eprintln!("No relay configured. Run `always-coder login` first.");
        return Err(EXIT_ERROR);
    }
    match config.auth_token {
        Some(token) if !token.is_empty() => Ok((config.server, token)),
        _ => {
            eprintln!("Authentication required. Run `always-coder login` first.");
            Err(EXIT_AUTH_REQUIRED)
        }
    }
}

fn session_error_code(err: &SessionError) -> i32 {
    eprintln!("{err}");
    match err {
        SessionError::ServerUnreachable(_) | SessionError::ReconnectExhausted => EXIT_UNREACHABLE,
        SessionError::SessionNotFound => EXIT_SESSION_NOT_FOUND,
        SessionError::Unauthorized => EXIT_AUTH_REQUIRED,
        _ => EXIT_ERROR,
    }
}

fn query_error_code(err: &QueryError) -> i32 {
    eprintln!("{err}");
    match err {
        QueryError::Unreachable(_) | QueryError::Timeout => EXIT_UNREACHABLE,
        QueryError::Relay { code, .. } => match code {
            ErrorCode::SessionNotFound | ErrorCode::SessionExpired => EXIT_SESSION_NOT_FOUND,
            ErrorCode::Unauthorized => EXIT_AUTH_REQUIRED,
            _ => EXIT_ERROR,
        },
        QueryError::Transport(_) => EXIT_ERROR,
    }
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Active => "active",
        SessionState::CliDetached => "cli-detached",
        SessionState::Closed => "closed",
    }
}

fn format_row(session: &SessionSummary) -> String {
    let age = Utc::now() - session.last_active_at;
    let active = if age.num_hours() > 0 {
        format!("{}h ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m ago", age.num_minutes())
    } else {
        "just now".to_string()
    };

    format!(
        "{:<8} {:<13} {:<20} {:<16} {:>5}  {}",
        session.session_id,
        state_name(session.state),
        truncate(&format!("{} {}", session.command, session.args.join(" ")), 20),
        truncate(session.label.as_deref().unwrap_or("-"), 16),
        session.web_peers,
        active
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.trim().to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{}…", cut.trim_end())
    }
}
