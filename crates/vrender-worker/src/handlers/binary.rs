//! Binary conversion and fusion.
//!
//! Conversion turns color and disparity frames into per-frame binaries plus a
//! fused rig file. Fusion (`run_conversion == false`) packs those binaries
//! into the final fused output.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use vrender_models::{ImageType, StageKind};
use vrender_storage::{join_address, remote_image_type_path, GlobFilter, StorageError};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::{WorkerError, WorkerResult};

/// `rig.json` -> `rig_fused.json`; the suffix goes before the first `.`.
pub fn fused_json_name(rig: &str) -> String {
    let base = rig.rsplit('/').next().unwrap_or(rig);
    match base.split_once('.') {
        Some((stem, ext)) => format!("{stem}_fused.{ext}"),
        None => format!("{base}_fused"),
    }
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

pub struct BinaryHandler;

impl BinaryHandler {
    /// Full-size color, falling back to level 0 when only levels were published.
    async fn download_color(&self, ctx: &JobContext) -> WorkerResult<Option<u32>> {
        let color_type = ctx.msg.color_type;
        match ctx.download(&[(color_type, None)]).await {
            Ok(_) => {}
            Err(WorkerError::Storage(StorageError::NotFound(key))) => {
                info!(key = %key, "Full-size color missing");
            }
            Err(e) => return Err(e),
        }
        if !is_empty_dir(&ctx.local_path(color_type, None)?) {
            return Ok(None);
        }

        ctx.download(&[(color_type, Some(0))]).await?;
        Ok(Some(0))
    }
}

#[async_trait]
impl StageHandler for BinaryHandler {
    fn kind(&self) -> StageKind {
        StageKind::ConvertToBinary
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let msg = &ctx.msg;
        let fused_json = fused_json_name(&msg.rig);
        let bin_dir = ctx.local_path(ImageType::Bin, None)?;
        let remote_bin = remote_image_type_path(msg, ImageType::Bin, None)?;

        ctx.download_rig().await?;
        let mut params = ctx.params();
        if msg.run_conversion {
            ctx.download(&[(msg.disparity_type, msg.level)]).await?;
            let color_level = self.download_color(ctx).await?;
            params.set_flag("color", ctx.local(msg.color_type, color_level)?);
            params.set_flag("disparity", ctx.local(msg.disparity_type, msg.level)?);
            params.clear_flag("fused");
        } else {
            ctx.download(&[(ImageType::Bin, None)]).await?;
            ctx.storage
                .download(
                    &join_address(&remote_bin, &fused_json),
                    &bin_dir.join(&fused_json),
                    &GlobFilter::all(),
                )
                .await?;
            // path checks in the binary only apply to set flags
            for flag in ["color", "disparity", "foreground_masks"] {
                params.clear_flag(flag);
            }
            params.set_flag("fused", ctx.local(ImageType::Fused, None)?);
        }
        params.set_flag("bin", bin_dir.to_string_lossy().into_owned());
        tokio::fs::create_dir_all(&bin_dir).await?;

        ctx.run_stage(&params).await?;

        if msg.run_conversion {
            ctx.upload(ImageType::Bin, None, None).await?;
            ctx.storage
                .upload(
                    &bin_dir.join(&fused_json),
                    &join_address(&remote_bin, &fused_json),
                    &GlobFilter::all(),
                )
                .await?;
        } else {
            ctx.storage
                .upload(
                    &ctx.local_path(ImageType::Fused, None)?,
                    &remote_image_type_path(msg, ImageType::Fused, None)?,
                    &GlobFilter::all(),
                )
                .await?;
        }
        Ok(())
    }
}
