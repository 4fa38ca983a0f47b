//! Stage identifier to handler lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use vrender_models::StageKind;

use crate::context::JobContext;
use crate::error::{WorkerError, WorkerResult};
use crate::handlers::{
    BinaryHandler, DepthHandler, ExportHandler, MasksHandler, ResizeHandler, TemporalFilterHandler,
    TransferHandler, UpsampleHandler,
};

/// Work for one stage kind: fetch inputs, run the binary, push outputs.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()>;
}

/// Handlers registered at start-up, keyed by stage kind.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<StageKind, Arc<dyn StageHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with a handler for every stage kind.
    pub fn standard() -> Self {
        Self::new()
            .with(MasksHandler)
            .with(ResizeHandler)
            .with(DepthHandler)
            .with(TemporalFilterHandler)
            .with(TransferHandler)
            .with(UpsampleHandler::plain())
            .with(UpsampleHandler::layered())
            .with(BinaryHandler)
            .with(ExportHandler)
    }

    /// Register `handler`, replacing any handler of the same kind.
    pub fn with(mut self, handler: impl StageHandler + 'static) -> Self {
        self.handlers.insert(handler.kind(), Arc::new(handler));
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Handler for a wire stage identifier such as `"DerpCLI: Level 3"`.
    pub fn lookup(&self, app: &str) -> WorkerResult<Arc<dyn StageHandler>> {
        let kind = StageKind::from_app(app)?;
        self.get(kind)
            .ok_or_else(|| WorkerError::job_failed(format!("No handler registered for {kind}")))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
