//! Render controller binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrender_pipeline::{standard_stages, BrokerBootstrap, Pipeline, PipelineConfig, RenderConfig, WorkerFleet};
use vrender_queue::{Broker, RedisBroker};
use vrender_storage::{Storage, StorageConfig};

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
            .with(fmt::layer().with_ansi(true).with_target(false))
            .with(env_filter)
            .init();
    }

    if let Err(e) = run().await {
        error!("Render failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = PipelineConfig::from_env();
    let mut render = RenderConfig::from_env().context("Invalid render configuration")?;
    render.validate().context("Invalid render configuration")?;
    info!(
        input_root = %render.input_root,
        output_root = %render.output_root,
        first = %render.first,
        last = %render.last,
        "Starting render"
    );

    let storage = Storage::for_addresses(&StorageConfig::from_env(), &[&render.input_root, &render.output_root])
        .await
        .context("Failed to open storage")?;

    let broker = Arc::new(RedisBroker::from_env().context("Failed to create broker client")?);
    let bootstrap = BrokerBootstrap::from_config(&settings);
    bootstrap.ensure(broker.as_ref()).await?;
    broker.init().await.context("Failed to initialise queues")?;

    let mut fleet = if settings.skip_setup {
        None
    } else {
        let log_dir = storage
            .local_path(&render.input_root)?
            .unwrap_or_else(PathBuf::new)
            .join("logs");
        Some(WorkerFleet::start(&settings, &log_dir)?)
    };

    let stages = standard_stages(&render);
    info!(stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(), "Stages");
    let pipeline = Pipeline::new(broker, Arc::new(storage), render, settings).with_bootstrap(bootstrap);

    let result = tokio::select! {
        result = pipeline.run(&stages) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    if let Some(fleet) = fleet.as_mut() {
        fleet.shutdown().await;
    }
    result
}
