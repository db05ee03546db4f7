//! always-coder-relay — the session relay server.
//!
//! Accepts WebSocket connections, routes control frames and opaque
//! encrypted envelopes between CLI hosts and web peers, and keeps session
//! records with a 24 h TTL. Payloads are never decrypted here.

use std::sync::Arc;

use anyhow::Result;
use always_coder::auth::HttpTokenVerifier;
use always_coder::relay::RelayServer;
use clap::Parser;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "always-coder-relay")]
#[command(version)]
#[command(about = "Session relay for always-coder")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Advertised WebSocket endpoint, echoed to clients in
    /// SESSION_CREATED (e.g. wss://relay.example.com/ws)
    #[arg(long)]
    endpoint: Option<String>,

    /// Token verification endpoint. Without it, authentication is
    /// disabled and only anonymous sessions are possible.
    #[arg(long)]
    auth_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let endpoint = args
        .endpoint
        .unwrap_or_else(|| format!("ws://{}/ws", args.bind));

    let verifier: Option<Arc<dyn always_coder::auth::TokenVerifier>> = match args.auth_endpoint {
        Some(auth_endpoint) => {
            log::info!("Verifying tokens against {auth_endpoint}");
            Some(Arc::new(HttpTokenVerifier::new(auth_endpoint)?))
        }
        None => {
            log::warn!("No auth endpoint configured; anonymous sessions only");
            None
        }
    };

    let server = RelayServer::bind(&args.bind, endpoint, verifier).await?;
    println!("Relay listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down.");
    server.shutdown();
    Ok(())
}
