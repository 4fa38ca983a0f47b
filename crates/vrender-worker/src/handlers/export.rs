use async_trait::async_trait;
use vrender_models::{ImageType, StageKind};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::WorkerResult;

const POSITION: &str = "0.0 0.0 0.0";
const FORWARD: &str = "-1.0 0.0 0.0";
const UP: &str = "0.0 0.0 1.0";

/// Renders full-size color and disparity into one export format.
pub struct ExportHandler;

#[async_trait]
impl StageHandler for ExportHandler {
    fn kind(&self) -> StageKind {
        StageKind::SimpleMeshRenderer
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let msg = &ctx.msg;
        let dst_type = msg.require_dst_image_type()?;

        ctx.download_rig().await?;
        ctx.download(&[(msg.color_type, None), (msg.disparity_type, None)])
            .await?;

        let mut params = ctx.params();
        params.set_flag("color", ctx.local(msg.color_type, None)?);
        params.set_flag("disparity", ctx.local(msg.disparity_type, None)?);
        params.set_flag("output", ctx.local(dst_type, None)?);
        params.set_flag("position", POSITION);
        params.set_flag("forward", FORWARD);
        params.set_flag("up", UP);

        ctx.run_stage(&params).await?;
        ctx.upload(dst_type, None, None).await?;
        Ok(())
    }
}
