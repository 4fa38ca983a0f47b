//! Render worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrender_queue::RedisBroker;
use vrender_storage::{Storage, StorageConfig};
use vrender_worker::{metrics, DispatchTable, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vrender=info".parse().unwrap())
        .add_directive("aws_config=warn".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting vrender-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        if let Err(e) = metrics::install_exporter(port) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
    }

    let broker = match RedisBroker::from_env() {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create broker client: {}", e);
            std::process::exit(1);
        }
    };

    let storage = match Storage::from_env().await {
        Ok(s) => s,
        Err(e) => {
            warn!("Object store unavailable, serving local roots only: {}", e);
            Storage::local_only(StorageConfig::from_env().share_mount_root)
        }
    };

    let executor = Arc::new(JobExecutor::new(
        config,
        Arc::new(broker),
        Arc::new(storage),
        DispatchTable::standard(),
    ));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_executor.shutdown();
        }
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
