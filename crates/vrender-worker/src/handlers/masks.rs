use async_trait::async_trait;
use vrender_models::{ImageType, StageKind};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::WorkerResult;

/// Foreground masks from color frames against the background frame.
pub struct MasksHandler;

#[async_trait]
impl StageHandler for MasksHandler {
    fn kind(&self) -> StageKind {
        StageKind::GenerateForegroundMasks
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let level = ctx.msg.level;
        let dst_level = ctx.dst_level()?;
        let background = ctx.background_frame()?;

        ctx.download_rig().await?;
        ctx.download(&[(ImageType::Color, level)]).await?;
        ctx.download_frames(&[(ImageType::BackgroundColor, level)], &[background])
            .await?;

        let mut params = ctx.params();
        params.set_flag("color", ctx.local(ImageType::Color, level)?);
        params.set_flag("background_color", ctx.local(ImageType::BackgroundColor, level)?);
        params.set_flag("foreground_masks", ctx.local(ImageType::ForegroundMasks, dst_level)?);

        ctx.run_stage(&params).await?;
        ctx.upload(ImageType::ForegroundMasks, None, dst_level).await?;
        Ok(())
    }
}
