//! always-coder CLI — share a local terminal with a web browser through an
//! end-to-end encrypted session relay.
//!
//! This is the host-side binary. See the `always_coder` library for the
//! session manager and the relay implementation.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use always_coder::commands;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// mimalloc outperforms the system allocator under the per-peer
/// encrypt-and-queue workload.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "always-coder")]
#[command(version)]
#[command(about = "Expose a local terminal to your browser, end-to-end encrypted")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a bearer token and seed the client configuration
    Login {
        /// Web application URL (defaults to the configured one)
        #[arg(long)]
        web_url: Option<String>,
        /// Provide the token directly instead of being prompted
        #[arg(long)]
        token: Option<String>,
    },
    /// Clear stored credentials
    Logout,
    /// Read or change configuration values
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start a session: run a command and bridge it to the relay
    Run {
        /// Label shown next to this session in listings
        #[arg(long)]
        label: Option<String>,
        /// Command and arguments to run in the PTY
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Reconnect to an existing owned session
    Attach {
        /// Six-character session id
        session_id: String,
        /// Override the command to run (defaults to the session's)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List your sessions
    List {
        /// Include detached sessions
        #[arg(long)]
        all: bool,
    },
    /// Show one session's details
    Info {
        /// Six-character session id
        session_id: String,
    },
    /// Delete a session permanently
    Delete {
        /// Six-character session id
        session_id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// Remove an optional configuration value
    Unset { key: String },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    // Foreground sessions end cleanly on SIGINT/SIGTERM. SIGHUP joins them
    // unless daemon mode wants the session to outlive the terminal.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::signal::SIGINT,
        signal_hook::consts::signal::SIGTERM,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            log::warn!("Failed to register signal handler: {e}");
        }
    }
    if !always_coder::config::daemon_mode() {
        if let Err(e) = signal_hook::flag::register(
            signal_hook::consts::signal::SIGHUP,
            Arc::clone(&shutdown),
        ) {
            log::warn!("Failed to register SIGHUP handler: {e}");
        }
    }

    // login/logout/config are synchronous (login uses a blocking HTTP
    // client); session and query commands get a runtime.
    let code = match cli.command {
        Commands::Login { web_url, token } => commands::login(web_url, token),
        Commands::Logout => commands::logout(),
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => commands::config_cmd("get", &key, None),
            ConfigAction::Set { key, value } => commands::config_cmd("set", &key, Some(&value)),
            ConfigAction::Unset { key } => commands::config_cmd("unset", &key, None),
        },
        command => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("Failed to start async runtime: {e}");
                    std::process::exit(commands::EXIT_ERROR);
                }
            };
            runtime.block_on(async {
                match command {
                    Commands::Run { label, command } => {
                        commands::run(command, label, shutdown).await
                    }
                    Commands::Attach {
                        session_id,
                        command,
                    } => commands::attach(session_id, command, shutdown).await,
                    Commands::List { all } => commands::list(all).await,
                    Commands::Info { session_id } => commands::info(session_id).await,
                    Commands::Delete { session_id } => commands::delete(session_id).await,
                    Commands::Login { .. } | Commands::Logout | Commands::Config { .. } => {
                        unreachable!("handled synchronously")
                    }
                }
            })
        }
    };

    std::process::exit(code);
}
