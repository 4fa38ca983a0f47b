use async_trait::async_trait;
use vrender_models::{frame_range, ImageType, StageKind};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::WorkerResult;

/// Temporal bilateral filter over one level.
///
/// Reads the widened `filter_first..=filter_last` window but only publishes
/// the frames of the job's own chunk.
pub struct TemporalFilterHandler;

#[async_trait]
impl StageHandler for TemporalFilterHandler {
    fn kind(&self) -> StageKind {
        StageKind::TemporalFilter
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let msg = &ctx.msg;
        let level = msg.level;
        let first = msg.filter_first.as_ref().unwrap_or(&msg.first);
        let last = msg.filter_last.as_ref().unwrap_or(&msg.last);
        let window = frame_range(first, last);

        let mut types = vec![(ImageType::Color, level), (ImageType::Disparity, level)];
        if msg.use_foreground_masks {
            types.push((ImageType::ForegroundMasks, level));
        }
        ctx.download_rig().await?;
        ctx.download_frames(&types, &window).await?;

        let mut params = ctx.params();
        params.clear_flag("disparity");
        ctx.run_stage(&params).await?;

        let frames = msg.frames();
        ctx.upload(ImageType::DisparityTimeFiltered, Some(&frames), level)
            .await?;
        Ok(())
    }
}
