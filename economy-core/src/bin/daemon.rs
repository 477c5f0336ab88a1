//! Economy daemon binary
//!
//! Opens the economy, runs the leaderboard engine and logs a periodic
//! summary until interrupted. Usage: `economy-daemon [config.toml]`.

use anyhow::Context;
use economy_core::{Config, Economy};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting economy daemon"
    );

    let economy = Economy::open(config).context("opening economy")?;
    economy.start_leaderboard()?;

    let mut report = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for shutdown signal")?;
                break;
            }
            _ = report.tick() => {
                let snapshot = economy.leaderboard();
                tracing::info!(
                    accounts = snapshot.len(),
                    total = %economy.format(snapshot.total()),
                    cached = economy.cache().live_count(),
                    "Economy status"
                );
            }
        }
    }

    tracing::info!("Shutting down economy daemon");
    economy.shutdown().await;
    tracing::debug!(metrics = %economy.metrics().gather_text(), "Final metrics");
    Ok(())
}
