//! Authentication: login seeding and bearer-token verification.
//!
//! `login` performs a one-shot fetch of `GET {webUrl}/api/config.json` to
//! seed the client (relay endpoint plus identity-provider coordinates),
//! then persists the bearer token to the user config. The identity
//! provider itself is an external collaborator; the relay talks to it only
//! through the [`TokenVerifier`] trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use crate::config::Config;
use crate::ws::normalize_url;

/// Response from `GET {webUrl}/api/config.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Relay endpoint (`wss://...`).
    pub server: String,
    /// Canonical web application URL.
    pub web_url: String,
    /// Identity-provider coordinates.
    pub cognito: CognitoConfig,
}

/// Identity-provider block of the server config.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitoConfig {
    pub user_pool_id: String,
    pub client_id: String,
    pub region: String,
}

/// Fetch the server config endpoint once.
///
/// # Errors
///
/// Returns an error on network failure, non-2xx status, or a response that
/// does not match the expected shape.
pub fn fetch_server_config(web_url: &str) -> Result<ServerConfig> {
    let url = format!("{}/api/config.json", normalize_url(web_url)?);

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let response = client
        .get(&url)
        .send()
        .with_context(|| format!("Failed to reach {url}"))?;

    if !response.status().is_success() {
        anyhow::bail!("Server returned {} for {url}", response.status());
    }

    response.json().context("Invalid server config response")
}

/// Run the login flow: seed from the server config, store the token.
///
/// When `token` is `None` and stdin is a TTY, the token is prompted for
/// interactively.
///
/// # Errors
///
/// Returns an error if the config endpoint is unreachable or no token was
/// provided in a non-interactive environment.
pub fn login(config: &mut Config, web_url: &str, token: Option<String>) -> Result<()> {
    let server_config = fetch_server_config(web_url)?;

    config.server = server_config.server;
    config.web_url = normalize_url(&server_config.web_url)?;
    config.cognito_user_pool_id = Some(server_config.cognito.user_pool_id);
    config.cognito_client_id = Some(server_config.cognito.client_id);
    config.cognito_region = Some(server_config.cognito.region);

    let token = match token {
        Some(token) => token,
        None if atty::is(atty::Stream::Stdin) => prompt_for_token()?,
        None => anyhow::bail!("No token provided and stdin is not a terminal"),
    };

    if token.trim().is_empty() {
        anyhow::bail!("Empty token");
    }

    config.auth_token = Some(token.trim().to_string());
    config.save()?;

    println!("  Logged in. Relay: {}", config.server);
    Ok(())
}

fn prompt_for_token() -> Result<String> {
    println!();
    println!("  Obtain an access token from your account page, then paste it here.");
    println!();
    print!("  Token: ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input)
}

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Stable user id, used for session ownership.
    pub user_id: String,
    /// Email for display in listings.
    pub email: String,
}

/// Validates bearer tokens against the identity provider.
///
/// The relay consults this once per connection, at accept time. A `None`
/// verdict means the token is invalid; transport-level errors should be
/// surfaced as `Err` so they are logged rather than treated as rejection.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token, returning the identity it belongs to.
    async fn verify(&self, token: &str) -> Result<Option<AuthUser>>;
}

/// Verifier that POSTs the token to an HTTP endpoint.
///
/// Expects a JSON `{ "userId": ..., "email": ... }` body on success and
/// 401/403 for invalid tokens.
#[derive(Debug)]
pub struct HttpTokenVerifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTokenVerifier {
    /// Create a verifier for the given endpoint.
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { endpoint, client })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    user_id: String,
    email: String,
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<AuthUser>> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Token verification request to {} failed", self.endpoint))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Ok(None);
        }

        if !response.status().is_success() {
            anyhow::bail!("Verifier returned {}", response.status());
        }

        let body: VerifyResponse = response.json().await?;
        Ok(Some(AuthUser {
            user_id: body.user_id,
            email: body.email,
        }))
    }
}

/// In-memory verifier for development and tests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthUser>,
}

impl StaticTokenVerifier {
    /// Build a verifier from `(token, user_id, email)` triples.
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        Self {
            tokens: entries
                .into_iter()
                .map(|(token, user_id, email)| (token, AuthUser { user_id, email }))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<AuthUser>> {
        Ok(self.tokens.get(token).cloned())
    }
}
