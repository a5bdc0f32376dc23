use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use visitor_counter::api::{start_api_server, AppState};
use visitor_counter::{build_counter, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting visitor counter service"
    );

    if config.service.metrics_enabled {
        init_metrics(&config.service.name, config.service.metrics_port)?;
    }

    let counter = Arc::new(build_counter(&config).context("Failed to initialize counter")?);

    info!(
        backend = %counter.backend_kind(),
        anonymized = counter.anonymizes_users(),
        "Counter engine ready"
    );

    let api_state = AppState {
        counter,
        service_name: config.service.name.clone(),
        admin_token: config.api.admin_token.clone().filter(|t| !t.is_empty()),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    shutdown_signal(&config.service.name).await;

    info!("Shutting down visitor counter service");

    api_handle.abort();

    info!("Visitor counter service stopped");

    Ok(())
}

/// JSON logs filtered by `RUST_LOG`, else the configured level
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_current_span(false))
        .init();
}

/// Expose counter metrics on a Prometheus scrape endpoint
fn init_metrics(service: &str, port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .add_global_label("service", service)
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(service = %service, port, "Counter metrics exporter listening");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal(service: &str) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(service = %service, signal = received, "Stopping counter on signal");
}
