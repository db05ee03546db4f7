//! Configuration loading and persistence.
//!
//! User configuration lives at `~/.always-coder/config.json` (mode 0600 on
//! POSIX). A sibling `config.local.json` next to the installed binary
//! provides development defaults; the user file overrides it for auth
//! fields. Environment variables override both.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

use crate::ws::normalize_url;

/// Configuration for the always-coder CLI.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Relay endpoint (`wss://...`).
    pub server: String,
    /// Web application base URL (`http[s]://...`).
    pub web_url: String,
    /// Authenticated user id, set by `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Bearer token presented to the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Refresh token from the identity provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Label shown next to this machine's sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_label: Option<String>,
    /// Identity provider pool id, seeded by `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognito_user_pool_id: Option<String>,
    /// Identity provider client id, seeded by `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognito_client_id: Option<String>,
    /// Identity provider region, seeded by `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognito_region: Option<String>,
}

impl Config {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// `ALWAYS_CODER_CONFIG_DIR` overrides the default `~/.always-coder`
    /// (used by tests to avoid touching the real home directory).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("ALWAYS_CODER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".always-coder")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration: local development defaults, then the user file,
    /// then environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_local_defaults().unwrap_or_default();

        if let Ok(user) = Self::load_from_file() {
            // User config wins wholesale; auth fields in particular must
            // never be inherited from the install directory.
            config = merge(config, user);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Development defaults from `config.local.json` next to the binary.
    fn load_local_defaults() -> Option<Self> {
        let exe = std::env::current_exe().ok()?;
        let path = exe.parent()?.join("config.local.json");
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server) = std::env::var("ALWAYS_CODER_SERVER") {
            if server.starts_with("wss://") {
                self.server = server;
            } else {
                log::warn!("Ignoring ALWAYS_CODER_SERVER (must be wss://...): {server}");
            }
        }

        if let Ok(web_url) = std::env::var("ALWAYS_CODER_WEB_URL") {
            match normalize_url(&web_url) {
                Ok(url) => self.web_url = url,
                Err(e) => log::warn!("Ignoring ALWAYS_CODER_WEB_URL: {e}"),
            }
        }
    }

    /// Persist the current configuration with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only; best-effort elsewhere
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// True when a bearer token is present.
    pub fn has_token(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Instance label, falling back to the machine hostname.
    pub fn label(&self) -> String {
        self.instance_label.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "always-coder".to_string())
        })
    }

    /// Read a config key by its wire name (`config get`).
    pub fn get_key(&self, key: &str) -> Result<Option<String>> {
        Ok(match key {
            "server" => Some(self.server.clone()),
            "webUrl" => Some(self.web_url.clone()),
            "userId" => self.user_id.clone(),
            "instanceLabel" => self.instance_label.clone(),
            "cognitoUserPoolId" => self.cognito_user_pool_id.clone(),
            "cognitoClientId" => self.cognito_client_id.clone(),
            "cognitoRegion" => self.cognito_region.clone(),
            _ => anyhow::bail!("unknown config key: {key}"),
        })
    }

    /// Set a config key by its wire name (`config set`).
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server" => {
                if !value.starts_with("wss://") {
                    anyhow::bail!("server must be a wss:// URL");
                }
                self.server = value.to_string();
            }
            "webUrl" => self.web_url = normalize_url(value)?,
            "instanceLabel" => self.instance_label = Some(value.to_string()),
            "cognitoUserPoolId" => self.cognito_user_pool_id = Some(value.to_string()),
            "cognitoClientId" => self.cognito_client_id = Some(value.to_string()),
            "cognitoRegion" => self.cognito_region = Some(value.to_string()),
            _ => anyhow::bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    /// Clear a config key (`config unset`).
    pub fn unset_key(&mut self, key: &str) -> Result<()> {
        match key {
            "instanceLabel" => self.instance_label = None,
            "cognitoUserPoolId" => self.cognito_user_pool_id = None,
            "cognitoClientId" => self.cognito_client_id = None,
            "cognitoRegion" => self.cognito_region = None,
            "server" | "webUrl" => anyhow::bail!("{key} cannot be unset, only changed"),
            _ => anyhow::bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    /// Clear auth state (`logout`).
    pub fn clear_auth(&mut self) {
        self.user_id = None;
        self.auth_token = None;
        self.refresh_token = None;
    }
}

/// Overlay `user` on top of `base`, field by field.
fn merge(base: Config, user: Config) -> Config {
    Config {
        server: if user.server.is_empty() { base.server } else { user.server },
        web_url: if user.web_url.is_empty() { base.web_url } else { user.web_url },
        user_id: user.user_id,
        auth_token: user.auth_token,
        refresh_token: user.refresh_token,
        instance_label: user.instance_label.or(base.instance_label),
        cognito_user_pool_id: user.cognito_user_pool_id.or(base.cognito_user_pool_id),
        cognito_client_id: user.cognito_client_id.or(base.cognito_client_id),
        cognito_region: user.cognito_region.or(base.cognito_region),
    }
}

/// True when daemon-mode PTY wrapping was requested.
pub fn daemon_mode() -> bool {
    std::env::var("ALWAYS_CODER_DAEMON").is_ok_and(|v| v == "true")
}
