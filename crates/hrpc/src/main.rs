#![forbid(unsafe_code)]

use clap::Parser;
use hrpc::client::{ConnStatus, HubClient};
use hrpc::config::{load_config, Cli, Commands, PublishCommand};
use hrpc::publisher::Publisher;
use hrp_common::types::PublishTarget;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Parse the payload argument as JSON, wrapping bare text as a JSON string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref server) = cli.server {
        config.server = server.clone();
    }
    if let Some(ref api) = cli.api {
        config.api = api.clone();
    }
    if let Some(ref hub) = cli.hub {
        config.hub = hub.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    match cli.command {
        Commands::Listen { ref groups } => listen(Arc::new(config), groups).await,
        Commands::Publish { ref target } => publish(&config, target).await,
    }
}

async fn listen(config: Arc<hrpc::config::ClientConfig>, groups: &[String]) -> anyhow::Result<()> {
    info!(server = %config.server, hub = %config.hub, "connecting to hub");
    let client = HubClient::spawn(config);
    let mut inbox = client.subscribe();
    let mut status = client.status();

    for group in groups {
        client.join_group(group.clone()).await?;
    }

    loop {
        tokio::select! {
            event = inbox.recv() => {
                match event {
                    Ok(event) => println!("{}", event.payload),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "fell behind on pushed messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow();
                info!(status = ?current, "connection status changed");
                if current == ConnStatus::Disconnected {
                    anyhow::bail!("hub connection ended");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

async fn publish(
    config: &hrpc::config::ClientConfig,
    command: &PublishCommand,
) -> anyhow::Result<()> {
    let publisher = Publisher::from_config(config)?;
    let (target, payload) = match command {
        PublishCommand::Broadcast { payload } => (PublishTarget::Broadcast, parse_payload(payload)),
        PublishCommand::User { user, payload } => {
            (PublishTarget::User(user.clone()), parse_payload(payload))
        }
        PublishCommand::Group { group, payload } => {
            (PublishTarget::Group(group.clone()), parse_payload(payload))
        }
    };

    let report = publisher.publish(&target, &payload).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.all_failed() {
        anyhow::bail!(
            "delivery failed for all {} target connections",
            report.attempted
        );
    }
    Ok(())
}
