use crate::outbound::OverflowPolicy;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "hrps")]
#[command(about = "Hub relay server")]
#[command(version)]
pub struct Args {
    /// Socket address the WebSocket client gateway listens on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "HRPS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the HTTP API (publish, health, metrics).
    #[arg(long, default_value = "127.0.0.1:9090", env = "HRPS_API")]
    pub api_addr: SocketAddr,
    /// Name of the single hub this server scopes connections and groups to.
    #[arg(long, default_value = "message", env = "HRPS_HUB")]
    pub hub: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "HRPS_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "HRPS_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum inbound WebSocket message size in bytes.
    #[arg(long, default_value = "65535", env = "HRPS_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Per-connection outbound buffer capacity in messages.
    #[arg(long, default_value = "256", env = "HRPS_OUTBOUND_BUFFER")]
    pub outbound_buffer: usize,
    /// What to drop when a connection's outbound buffer is full.
    #[arg(long, value_enum, default_value = "drop-oldest", env = "HRPS_OVERFLOW_POLICY")]
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single WebSocket write, in seconds.
    #[arg(long, default_value = "10", env = "HRPS_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "HRPS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "HRPS_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Clock skew tolerance for token expiry checks, in seconds (0-60).
    #[arg(long, default_value = "30", env = "HRPS_CLOCK_SKEW")]
    pub clock_skew: u64,
    /// Accept client channels without an access token.
    #[arg(long, env = "HRPS_NO_CLIENT_AUTH")]
    pub no_client_auth: bool,
    /// Path to the shared signing secret file (mode 0600, at least 32 bytes).
    #[arg(long, env = "HRPS_SECRET_FILE")]
    pub secret_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the WebSocket client gateway listens on.
    pub listen: SocketAddr,
    /// Socket address for the HTTP API.
    pub api_addr: SocketAddr,
    /// Name of the single hub.
    pub hub: String,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_payload: usize,
    /// Per-connection outbound buffer capacity in messages.
    pub outbound_buffer: usize,
    /// What to drop when a connection's outbound buffer is full.
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single WebSocket write, in seconds.
    pub write_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Clock skew tolerance for token expiry checks, in seconds.
    pub clock_skew: u64,
    /// Whether client channels must present a valid access token.
    pub client_auth: bool,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.hub.is_empty() {
            return Err("hub name must not be empty".to_string());
        }
        if self
            .hub
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err("hub name must be alphanumeric with - or _".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        const MAX_ALLOWED_PAYLOAD: usize = 1_048_576;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({MAX_ALLOWED_PAYLOAD} bytes)"
            ));
        }

        if self.outbound_buffer == 0 {
            return Err("outbound_buffer must be greater than 0".to_string());
        }
        if self.outbound_buffer > 65_536 {
            return Err("outbound_buffer exceeds reasonable limit (65,536 messages)".to_string());
        }

        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.write_timeout > 300 {
            return Err("write_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.clock_skew > 60 {
            return Err("clock_skew exceeds maximum allowed window (60 seconds)".to_string());
        }

        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            api_addr: args.api_addr,
            hub: args.hub,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_payload: args.max_payload,
            outbound_buffer: args.outbound_buffer,
            overflow_policy: args.overflow_policy,
            write_timeout: args.write_timeout,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            clock_skew: args.clock_skew,
            client_auth: !args.no_client_auth,
        }
    }
}
