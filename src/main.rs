//! # notifyd
//!
//! Realtime notification gateway: serves per-user WebSocket feeds backed by
//! the message broker, and publishes test messages onto it.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify_broker::{Broker, Publisher};
use notify_core::{Message, MessageId, UserId};
use notify_server::{resolver_from_settings, AppState, FanoutOrchestrator, ShutdownCoordinator};
use notify_settings::{load_settings_from_path, settings_path, GatewaySettings, LoggingSettings};
use notify_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "notifyd", about = "Realtime notification fan-out gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve WebSocket feeds until interrupted.
    Serve {
        /// Settings file (defaults to `~/.notifyd/settings.json`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Publish one message to a user's feed.
    Publish {
        /// Recipient user id (routing key).
        #[arg(long)]
        user: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        author: String,
        /// Message id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load(config: Option<PathBuf>) -> Result<GatewaySettings> {
    let path = config.unwrap_or_else(settings_path);
    load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

fn init_logging(logging: &LoggingSettings) -> Result<()> {
    let log_level = parse_level(&logging.level)
        .with_context(|| format!("invalid log level: {}", logging.level))?;
    let config = TelemetryConfig {
        log_level,
        json: logging.json,
        ..TelemetryConfig::default()
    };
    init_telemetry(&config).context("failed to install tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            let settings = load(config)?;
            init_logging(&settings.logging)?;
            serve(settings).await
        }
        Command::Publish {
            user,
            text,
            author,
            id,
            config,
        } => {
            let settings = load(config)?;
            init_logging(&settings.logging)?;
            let id = id.map_or_else(MessageId::generate, MessageId::from_raw);
            let message = Message::new(id, text, UserId::from_raw(author));
            publish(&settings, &UserId::from_raw(user), &message).await
        }
    }
}

async fn serve(settings: GatewaySettings) -> Result<()> {
    info!(name = %settings.app.name, "starting notifyd");

    let broker = notify_broker::connect(&settings.broker, &settings.app.name)
        .await
        .context("failed to connect to message broker")?;
    let broker_kind = broker.kind();
    let orchestrator = Arc::new(FanoutOrchestrator::new(broker));
    let coordinator = ShutdownCoordinator::new();

    let state = AppState::new(
        Arc::clone(&orchestrator),
        resolver_from_settings(&settings.auth),
        coordinator.token(),
        settings.server.max_message_size,
    );
    let server = notify_server::start(&settings.server, state)
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                settings.server.host, settings.server.port
            )
        })?;
    info!(addr = %server.local_addr, broker = broker_kind, "notifyd ready");

    coordinator.wait_for_signal().await;
    info!("shutting down");

    let graceful = Duration::from_secs(settings.app.graceful_shutdown_timeout_secs);
    let force = Duration::from_secs(settings.app.force_shutdown_timeout_secs);
    let drain = async {
        coordinator.shutdown();
        let mut tasks = orchestrator.shutdown().await;
        tasks.push(server.task);
        coordinator.graceful_shutdown(tasks, graceful).await
    };
    match tokio::time::timeout(force, drain).await {
        Ok(true) => info!("shutdown complete"),
        Ok(false) => warn!("graceful shutdown deadline passed"),
        Err(_) => warn!("forced shutdown after {force:?}"),
    }
    Ok(())
}

async fn publish(settings: &GatewaySettings, user: &UserId, message: &Message) -> Result<()> {
    let broker = notify_broker::connect(&settings.broker, &settings.app.name)
        .await
        .context("failed to connect to message broker")?;
    Publisher::new(broker)
        .publish(user, message)
        .await
        .with_context(|| format!("failed to publish to {user}"))?;
    info!(user_id = %user, message_id = %message.id, "published");
    Ok(())
}
