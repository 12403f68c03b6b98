//! Service registry agent.
//!
//! Loads a TOML config, mirrors the registry root from etcd, optionally
//! announces this process as an instance, and logs membership until it is
//! told to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use service_registry::config::loader::{apply_env_overrides, load_config};
use service_registry::config::AnnounceConfig;
use service_registry::lifecycle::wait_for_signal;
use service_registry::net::TcpConnector;
use service_registry::observability::{init_logging, metrics};
use service_registry::store::EtcdStore;
use service_registry::{RegistryConfig, RegistryError, TcpServicePool};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "service-registry")]
#[command(about = "Mirror a service registry from etcd and keep connections to it", long_about = None)]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RegistryConfig::default(),
    };
    let config = apply_env_overrides(config)?;

    init_logging(&config.observability);
    tracing::info!("service-registry v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        endpoints = ?config.store.endpoints,
        root = %config.store.root,
        dial_timeout_secs = config.dial.timeout_secs,
        retry_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let store = Arc::new(EtcdStore::new(&config.store)?);
    let pool = TcpServicePool::start(&config, store, TcpConnector::new()).await?;

    let mut announced = match &config.announce {
        Some(announce) => try_announce(&pool, announce).await?,
        None => true,
    };

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let signal = wait_for_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = status.tick() => {
                log_status(&pool);
                if let (false, Some(announce)) = (announced, &config.announce) {
                    announced = try_announce(&pool, announce).await?;
                }
            }
            _ = &mut signal => break,
        }
    }

    if let Some(announce) = &config.announce {
        if let Err(e) = pool.withdraw(&announce.service, &announce.instance_id).await {
            tracing::warn!(error = %e, "Failed to withdraw announcement");
        }
    }
    pool.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Announce this process. A store outage is logged and left for the next
/// status tick; any other failure stops the agent.
async fn try_announce(pool: &TcpServicePool, announce: &AnnounceConfig) -> Result<bool, RegistryError> {
    match pool
        .announce(&announce.service, &announce.instance_id, &announce.address)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_retryable() => {
            tracing::warn!(error = %e, service = %announce.service, "Announce failed, retrying later");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn log_status(pool: &TcpServicePool) {
    for (service, endpoints) in pool.table().services() {
        tracing::info!(service = %service, endpoints, "Service status");
    }
    let pending = pool.pending_retries();
    if !pending.is_empty() {
        tracing::info!(pending = ?pending, "Instances awaiting retry");
    }
}
