use async_trait::async_trait;
use tracing::debug;
use vrender_models::StageKind;

use crate::context::{required, JobContext};
use crate::dispatch::StageHandler;
use crate::error::WorkerResult;

/// Copies frames of one image type and level to another; runs no binary.
pub struct TransferHandler;

#[async_trait]
impl StageHandler for TransferHandler {
    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let msg = &ctx.msg;
        let src_type = required(msg.src_image_type, "src_image_type")?;
        let dst_type = msg.require_dst_image_type()?;
        let cameras = if msg.cameras.is_empty() {
            ctx.load_rig().await?.camera_ids()
        } else {
            msg.cameras.clone()
        };
        debug!(src = %src_type, dst = %dst_type, cameras = cameras.len(), "Transferring frames");

        ctx.storage
            .copy_image_level(
                msg,
                src_type,
                dst_type,
                &cameras,
                &msg.frames(),
                msg.src_level,
                ctx.dst_level()?,
            )
            .await?;
        Ok(())
    }
}
