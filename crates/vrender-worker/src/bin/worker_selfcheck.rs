use std::path::Path;

use vrender_queue::{Broker, RedisBroker};
use vrender_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with scratch_dir={} bin_dir={}",
        config.scratch_dir.display(),
        config.bin_dir.display()
    );
    ensure_scratch(&config.scratch_dir).await?;
    ensure_bin_dir(&config.bin_dir)?;
    ensure_broker().await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_scratch(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("scratch dir {} not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_bin_dir(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        return Err(anyhow::anyhow!("binary dir {} does not exist", path.display()));
    }
    Ok(())
}

async fn ensure_broker() -> anyhow::Result<()> {
    let broker = RedisBroker::from_env()?;
    broker
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("broker unreachable: {}", e))
}
