//! Silo host entry point
//!
//! Runs one silo's messaging transport with an echo dispatcher: every
//! application or system request is answered with a success response that
//! carries the request body back.

use anyhow::{Context, Result};
use clap::Parser;
use silo_config::SiloConfig;
use silo_network::{MessageCenter, MessageCenterBuilder, ShutdownParticipant};
use silo_types::{Category, Direction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "services/silo_host/config/silo.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting silo host");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SiloConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let center = MessageCenterBuilder::new(config)
        .build()
        .await
        .context("Failed to create message center")?;
    center.start().context("Failed to start message center")?;

    info!(
        silo = %center.my_address(),
        gateway = ?center.gateway_address(),
        "silo ready"
    );

    let dispatchers: Vec<_> = Category::ALL
        .into_iter()
        .map(|category| tokio::spawn(dispatch(Arc::clone(&center), category)))
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Shutdown signal received");

    shutdown(&center).await;
    for dispatcher in dispatchers {
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "dispatcher task failed");
        }
    }

    match serde_json::to_string(&center.stats_snapshot()) {
        Ok(stats) => info!(%stats, "final messaging statistics"),
        Err(e) => warn!(error = %e, "unable to render messaging statistics"),
    }
    Ok(())
}

/// Echo requests of `category` until the inbound queue stops.
async fn dispatch(center: Arc<MessageCenter>, category: Category) {
    while let Some(msg) = center.receive(category).await {
        match msg.direction {
            Direction::Request => {
                let response = msg.create_response().with_body(msg.body().to_vec());
                center.send_message(response);
            }
            Direction::Response if msg.is_rejection() => {
                warn!(message = %msg, rejection = ?msg.rejection, "rejection received");
            }
            _ => debug!(message = %msg, "received"),
        }
    }
    debug!(?category, "dispatcher stopped");
}

async fn shutdown(center: &Arc<MessageCenter>) {
    center.begin_shutdown();
    center.block_application_messages();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
    while !center.can_finish_shutdown() {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                inbound = center.inbound_count(),
                outbound = center.outbound_count(),
                "queues not drained before deadline, stopping anyway"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    center.finish_shutdown().await;
    info!("Silo host stopped");
}
