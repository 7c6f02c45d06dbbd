use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI interface for the hub client.
#[derive(Parser)]
#[command(name = "hrpc", about = "Hub relay client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// WebSocket URL of the relay server.
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// HTTP URL of the relay's publish API.
    #[arg(long, global = true)]
    pub api: Option<String>,

    /// Hub name override.
    #[arg(long, global = true)]
    pub hub: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the hub and print pushed messages.
    Listen {
        /// Groups to join after connecting (repeatable).
        #[arg(long = "group")]
        groups: Vec<String>,
    },
    /// Publish a payload through the relay's HTTP API.
    Publish {
        /// Publish target.
        #[command(subcommand)]
        target: PublishCommand,
    },
}

/// Publish targets.
#[derive(Subcommand)]
pub enum PublishCommand {
    /// Deliver to every connected client.
    Broadcast {
        /// JSON payload (a bare string is wrapped as a JSON string).
        payload: String,
    },
    /// Deliver to every connection of one user.
    User {
        /// Target user id.
        user: String,
        /// JSON payload (a bare string is wrapped as a JSON string).
        payload: String,
    },
    /// Deliver to the members of one group.
    Group {
        /// Target group name.
        group: String,
        /// JSON payload (a bare string is wrapped as a JSON string).
        payload: String,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay server.
    pub server: String,
    /// HTTP URL of the relay's publish API.
    pub api: String,
    /// Hub name connections and publishes are scoped to.
    pub hub: String,
    /// Pre-issued access token for the client channel.
    pub token: Option<String>,
    /// Shared secret for self-signing tokens (dev deployments and the
    /// publisher side).
    pub secret: Option<String>,
    /// Subject claim stamped into self-signed connect tokens.
    pub subject: Option<String>,
    /// Lifetime of self-signed tokens, in seconds.
    pub token_ttl_s: u64,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectConfig,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:8080".to_string(),
            api: "http://127.0.0.1:9090".to_string(),
            hub: "message".to_string(),
            token: None,
            secret: None,
            subject: None,
            token_ttl_s: 300,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.is_empty() {
            return Err("server URL must not be empty".to_string());
        }
        if !(self.server.starts_with("ws://") || self.server.starts_with("wss://")) {
            return Err(format!(
                "server URL must start with ws:// or wss://, got: {}",
                self.server
            ));
        }

        if self.api.is_empty() {
            return Err("api URL must not be empty".to_string());
        }
        if !(self.api.starts_with("http://") || self.api.starts_with("https://")) {
            return Err(format!(
                "api URL must start with http:// or https://, got: {}",
                self.api
            ));
        }

        if self.hub.is_empty() {
            return Err("hub name must not be empty".to_string());
        }

        if self.token_ttl_s == 0 {
            return Err("token_ttl_s must be greater than 0".to_string());
        }
        if self.token_ttl_s > 86_400 {
            return Err("token_ttl_s exceeds reasonable limit (86400 seconds)".to_string());
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }

        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("server", defaults.server.as_str())?
        .set_default("api", defaults.api.as_str())?
        .set_default("hub", defaults.hub.as_str())?
        .set_default("token_ttl_s", defaults.token_ttl_s as i64)?
        .set_default(
            "reconnect.initial_delay_ms",
            defaults.reconnect.initial_delay_ms as i64,
        )?
        .set_default(
            "reconnect.max_delay_ms",
            defaults.reconnect.max_delay_ms as i64,
        )?
        .set_default(
            "reconnect.backoff_factor",
            defaults.reconnect.backoff_factor,
        )?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Check platform-native config dir first, then fall back to
        // ~/.config/hrpc/ (many tools use ~/.config/ even on macOS)
        let native_path = dirs::config_dir().map(|d| d.join("hrpc").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("hrpc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(config::Environment::with_prefix("HRPC").separator("_"));

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "ws://127.0.0.1:8080");
        assert_eq!(config.api, "http://127.0.0.1:9090");
        assert_eq!(config.hub, "message");
        assert!(config.token.is_none());
        assert!(config.secret.is_none());
    }

    #[test]
    fn load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(std::path::Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");
        assert_eq!(config.hub, "message");
        assert_eq!(config.reconnect.initial_delay_ms, 100);
        assert_eq!(config.keepalive.interval_s, 30);
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_invalid_server_scheme() {
        let mut config = ClientConfig::default();
        config.server = "http://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn validate_rejects_invalid_api_scheme() {
        let mut config = ClientConfig::default();
        config.api = "ws://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("http://"));
    }

    #[test]
    fn validate_rejects_empty_hub() {
        let mut config = ClientConfig::default();
        config.hub = String::new();
        assert!(config.validate().unwrap_err().contains("hub"));
    }

    #[test]
    fn validate_rejects_zero_token_ttl() {
        let mut config = ClientConfig::default();
        config.token_ttl_s = 0;
        assert!(config.validate().unwrap_err().contains("token_ttl_s"));
    }

    #[test]
    fn validate_rejects_zero_initial_delay() {
        let mut config = ClientConfig::default();
        config.reconnect.initial_delay_ms = 0;
        assert!(config.validate().unwrap_err().contains("initial_delay_ms"));
    }

    #[test]
    fn validate_rejects_max_delay_less_than_initial() {
        let mut config = ClientConfig::default();
        config.reconnect.initial_delay_ms = 1000;
        config.reconnect.max_delay_ms = 500;
        assert!(config.validate().unwrap_err().contains("max_delay_ms"));
    }

    #[test]
    fn validate_rejects_zero_backoff_factor() {
        let mut config = ClientConfig::default();
        config.reconnect.backoff_factor = 0.0;
        assert!(config.validate().unwrap_err().contains("backoff_factor"));
    }

    #[test]
    fn validate_rejects_zero_keepalive_interval() {
        let mut config = ClientConfig::default();
        config.keepalive.interval_s = 0;
        assert!(config.validate().unwrap_err().contains("keepalive"));
    }
}
