//! Local broker bootstrap.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};
use vrender_queue::{retry_async, Broker, RetryConfig};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};

/// Starts a single-node broker when none is reachable.
#[derive(Debug, Clone)]
pub struct BrokerBootstrap {
    command: Vec<String>,
    retry: RetryConfig,
}

impl BrokerBootstrap {
    pub fn new(command: Vec<String>, connect_attempts: u32) -> Self {
        Self {
            command,
            retry: RetryConfig::new("broker connect")
                .with_max_retries(connect_attempts)
                .with_base_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(4)),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.bootstrap_command.clone(), config.connect_attempts)
    }

    /// Make sure `broker` answers, starting a local instance if it does not.
    pub async fn ensure(&self, broker: &dyn Broker) -> PipelineResult<()> {
        if broker.ping().await.is_ok() {
            return Ok(());
        }

        warn!("Broker unreachable, starting a local instance");
        self.spawn()?;

        retry_async(&self.retry, || broker.ping())
            .await
            .into_result()
            .map_err(|e| PipelineError::broker_unavailable(format!("still unreachable after bootstrap: {e}")))?;
        info!("Broker is up");
        Ok(())
    }

    fn spawn(&self) -> PipelineResult<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PipelineError::config_error("Broker bootstrap command is empty"))?;
        let path = which::which(program)
            .map_err(|e| PipelineError::broker_unavailable(format!("cannot start {program}: {e}")))?;

        let child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(program = %path.display(), pid = ?child.id(), "Started broker");
        Ok(())
    }
}
