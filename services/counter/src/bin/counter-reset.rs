//! Reset one counter key against the configured backend.
//!
//! Usage: `counter-reset [key]` (defaults to `profile`)

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use visitor_counter::{build_counter, Config};

const DEFAULT_KEY: &str = "profile";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let key = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_KEY.to_string());
    let counter = build_counter(&config).context("Failed to initialize counter")?;

    info!(key = %key, backend = %counter.backend_kind(), "Resetting key");

    counter
        .reset(&key)
        .await
        .with_context(|| format!("Failed to reset key {}", key))?;
    let total = counter.get_total(&key).await?;

    info!(key = %key, total, "Reset complete");

    Ok(())
}
