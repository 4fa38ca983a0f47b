//! Depth estimation over a range of pyramid levels.
//!
//! Foreground runs read color, optional masks and the next coarser level's
//! disparity. Background runs read the background color levels and write
//! under `<input_root>/background`.

use async_trait::async_trait;
use vrender_models::{ImageType, LevelSpec, StageKind};
use vrender_storage::join_address;

use crate::context::{required, JobContext};
use crate::dispatch::StageHandler;
use crate::error::{WorkerError, WorkerResult};

pub struct DepthHandler;

#[async_trait]
impl StageHandler for DepthHandler {
    fn kind(&self) -> StageKind {
        StageKind::DepthEstimation
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let msg = &ctx.msg;
        let start = required(msg.level_start, "level_start")?;
        let end = msg.level_end.unwrap_or(start);
        let image_type = msg.require_image_type()?;
        let coarser = (start + 1 < msg.num_levels).then_some(start + 1);

        ctx.download_rig().await?;
        let mut params = ctx.params();
        match image_type {
            ImageType::Disparity => {
                let masks = msg.use_foreground_masks;
                let mut types = vec![(ImageType::Color, Some(start))];
                if masks {
                    ctx.download_frames(&[(ImageType::BackgroundDisp, Some(start))], &[ctx.background_frame()?])
                        .await?;
                    types.push((ImageType::ForegroundMasks, Some(start)));
                }
                if let Some(coarser) = coarser {
                    types.push((ImageType::Disparity, Some(coarser)));
                    if masks {
                        types.push((ImageType::ForegroundMasks, Some(coarser)));
                    }
                }
                ctx.download(&types).await?;
            }
            ImageType::BackgroundDisp => {
                let mut types = vec![(ImageType::BackgroundColor, Some(start))];
                if let Some(coarser) = coarser {
                    types.push((ImageType::BackgroundDisp, Some(coarser)));
                }
                ctx.download(&types).await?;
                params.set_flag("color", ctx.local(ImageType::BackgroundColorLevels, None)?);
                params.output_root = join_address(&msg.input_root, "background");
            }
            other => {
                return Err(WorkerError::job_failed(format!(
                    "Depth estimation cannot produce {other}"
                )))
            }
        }

        ctx.run_stage(&params).await?;

        let levels = match &msg.dst_level {
            LevelSpec::None => vec![Some(end)],
            spec => spec.levels(),
        };
        for level in levels {
            ctx.upload(image_type, None, level).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Scratch;
    use crate::testing::{fake_binary, job, local_context, recorded_args, remote_context, seed_remote, MemoryStore, RIG_JSON};
    use std::sync::Arc;
    use tempfile::TempDir;
    use vrender_models::FrameName;

    const FLAGS: &[&str] = &[
        "color",
        "foreground_masks",
        "background_disp",
        "input_root",
        "output_root",
        "level_start",
        "level_end",
        "use_foreground_masks",
    ];

    #[tokio::test]
    async fn test_foreground_run_reads_coarser_level_and_rewrites_roots() {
        let store = Arc::new(MemoryStore::default());
        store.insert("b", "shot/rig.json", RIG_JSON.as_bytes());

        let mut msg = job("DerpCLI: Level 1", 1, 1, "s3://b/shot");
        msg.num_levels = 3;
        msg.level_start = Some(1);
        msg.level_end = Some(1);
        msg.image_type = Some(ImageType::Disparity);
        msg.dst_level = LevelSpec::One(1);
        msg.set_flag("color", "s3://b/shot/video/color_levels");
        let frames = [FrameName::new(1)];
        seed_remote(&store, &msg, ImageType::Color, Some(1), &[("cam0/000001.png", "c")], &frames).await;
        seed_remote(&store, &msg, ImageType::Disparity, Some(2), &[("cam0/000001.pfm", "d")], &frames).await;

        let bin = TempDir::new().unwrap();
        fake_binary(
            bin.path(),
            "DerpCLI",
            FLAGS,
            r#"test -f "$flag_color/level_1/cam0/000001.png" || exit 2
test -f "$flag_output_root/disparity_levels/level_2/cam0/000001.pfm" || exit 3
mkdir -p "$flag_output_root/disparity_levels/level_1/cam0"
echo d > "$flag_output_root/disparity_levels/level_1/cam0/000001.pfm""#,
        );

        let scratch_root = TempDir::new().unwrap();
        let scratch = Scratch::new(scratch_root.path());
        DepthHandler
            .handle(&remote_context(msg, store.clone(), &scratch, bin.path()))
            .await
            .unwrap();

        let args = recorded_args(bin.path(), "DerpCLI");
        assert_eq!(args["color"], scratch.input().join("video/color_levels").display().to_string());
        assert_eq!(args["output_root"], scratch.output().display().to_string());
        assert!(store.get("b", "shot/output/disparity_levels/level_1/000001.tar").is_some());
    }

    #[tokio::test]
    async fn test_background_run_writes_under_background_root() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().display().to_string();
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "DerpCLI", FLAGS, "exit 0");

        let mut msg = job("DerpCLI: Background", 100, 100, &root_str);
        msg.level_start = Some(0);
        msg.image_type = Some(ImageType::BackgroundDisp);
        DepthHandler.handle(&local_context(msg, bin.path())).await.unwrap();

        let args = recorded_args(bin.path(), "DerpCLI");
        assert_eq!(args["color"], format!("{root_str}/background/color_levels"));
        assert_eq!(args["output_root"], format!("{root_str}/background"));
        assert_eq!(args["level_start"], "0");
    }

    #[tokio::test]
    async fn test_requires_level_start_and_supported_type() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().display().to_string();
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "DerpCLI", FLAGS, "exit 0");

        let mut msg = job("DerpCLI", 1, 1, &root_str);
        msg.image_type = Some(ImageType::Disparity);
        let err = DepthHandler
            .handle(&local_context(msg.clone(), bin.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("level_start"), "{err}");

        msg.level_start = Some(0);
        msg.image_type = Some(ImageType::Color);
        let err = DepthHandler
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::JobFailed(_)), "{err}");
        assert!(!bin.path().join("DerpCLI.args").exists());
    }
}
