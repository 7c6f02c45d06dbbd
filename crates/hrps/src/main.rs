#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hrps::config::{Args, ServerConfig};
use hrps::metrics::HealthState;
use hrps::ServerState;
use rand::rngs::OsRng;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Maximum number of connections awaiting the upgrade and token check.
/// This prevents DoS by exhausting file descriptors before authentication.
const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Minimum acceptable shared-secret length in bytes.
const MIN_SECRET_LEN: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.clone().into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let secret = if let Some(ref path) = args.secret_file {
        load_secret(path)?
    } else if let Ok(value) = std::env::var("HRPS_SECRET") {
        let bytes = value.into_bytes();
        if bytes.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "HRPS_SECRET too short, expected at least {} bytes",
                MIN_SECRET_LEN
            );
        }
        info!("loaded secret from environment");
        bytes
    } else {
        generate_secret()
    };

    let state = Arc::new(ServerState::new(
        config.clone(),
        secret,
        MAX_PRE_AUTH_CONNECTIONS,
    ));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let state = Arc::clone(&state);
        let health_state = health_state.clone();
        async move {
            if let Err(e) = hrps::api::serve(config.api_addr, state, health_state).await {
                warn!("api server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = hrps::run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

fn load_secret(path: &Path) -> Result<Vec<u8>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)?;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "secret file permissions too open: {:o}. Expected 0600",
                mode
            );
        }
    }

    let data = std::fs::read(path)?;
    if data.len() < MIN_SECRET_LEN {
        anyhow::bail!(
            "secret file too short, expected at least {} bytes",
            MIN_SECRET_LEN
        );
    }
    info!("loaded secret from {}", path.display());
    Ok(data)
}

fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; MIN_SECRET_LEN];
    OsRng.fill(&mut secret[..]);
    warn!("using ephemeral secret (not persisted); tokens from other processes will not verify");
    secret
}
