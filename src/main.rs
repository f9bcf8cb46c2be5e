//! mongate - document-database wire protocol gateway
//!
//! Accepts client connections, normalizes legacy traffic, and routes every
//! command through the configured stage pipeline.

use clap::Parser;
use mongate_server::metrics::run_metrics_server;
use mongate_server::{
    Config, Gateway, GatewayConfig, GatewayHandler, Metrics, Pipeline, PluginRegistry, ServerInfo,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mongate")]
#[command(about = "Wire protocol gateway with a pluggable stage pipeline")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "MONGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Client listen address (overrides the config file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Metrics listen address; enables the metrics server
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Seconds to keep serving after SIGTERM before draining
    #[arg(long)]
    term_sleep: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => {
            if let Some(ref path) = cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(bind) = cli.bind {
        config.network.bind_addr = bind;
    }
    if let Some(bind) = cli.metrics_bind {
        config.metrics.enabled = true;
        config.metrics.bind_addr = bind;
    }
    if let Some(secs) = cli.term_sleep {
        config.shutdown.term_sleep_secs = secs;
    }

    tracing::info!("Starting mongate");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Cursor timeout: {}s",
        config.gateway.idle_cursor_timeout_secs
    );
    tracing::info!(
        "  Compressors: {}",
        config
            .gateway
            .compressors
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let metrics = if config.metrics.enabled {
        tracing::info!("  Metrics: enabled ({})", config.metrics.bind_addr);
        Some(Arc::new(Metrics::new()?))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let registry = PluginRegistry::with_builtins();
    let plugins = registry.build(&config.plugin_specs()?)?;
    let handler = Arc::new(GatewayHandler::new(
        ServerInfo::default(),
        config.gateway.compressors.clone(),
    ));
    let mut pipeline = Pipeline::new(plugins, handler);
    tracing::info!("  Pipeline: [{}]", pipeline.stage_names().join(", "));

    let mut gateway_config = GatewayConfig::from_config(&config);
    if let Some(ref metrics) = metrics {
        pipeline = pipeline.with_metrics(metrics.clone());
        gateway_config = gateway_config.with_metrics(metrics.clone());
    }
    let gateway = Arc::new(Gateway::new(gateway_config, pipeline));

    let metrics_shutdown = CancellationToken::new();
    if let Some(metrics) = metrics {
        let addr = config.metrics.bind_addr;
        let health = gateway.health();
        let shutdown = metrics_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, health, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let shutdown_gateway = gateway.clone();
    let term_sleep = config.shutdown.term_sleep();
    let deadline = config.shutdown.deadline();
    let drained = tokio::spawn(async move {
        let terminated = wait_for_signal().await;
        if terminated && !term_sleep.is_zero() {
            // Load balancers keep routing for a while after SIGTERM.
            tracing::info!("Received SIGTERM, draining in {:?}", term_sleep);
            tokio::time::sleep(term_sleep).await;
        } else {
            tracing::info!("Received shutdown signal, draining");
        }
        shutdown_gateway.shutdown(deadline).await
    });

    gateway.run().await?;

    if !drained.await.unwrap_or(false) {
        tracing::warn!("Some connections were closed forcibly");
    }
    metrics_shutdown.cancel();
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Waits for SIGINT or SIGTERM. Returns `true` for SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => false,
            _ = sigterm.recv() => true,
        },
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            false
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    tokio::signal::ctrl_c().await.ok();
    false
}
