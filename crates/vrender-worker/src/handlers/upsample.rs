//! Disparity upsampling, optionally followed by layering the foreground over
//! the upsampled background.

use async_trait::async_trait;
use vrender_models::{ImageType, StageKind};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::{WorkerError, WorkerResult};

const UPSAMPLE_BINARY: &str = "UpsampleDisparity";
const LAYER_BINARY: &str = "LayerDisparities";

pub struct UpsampleHandler {
    layer: bool,
}

impl UpsampleHandler {
    pub fn plain() -> Self {
        Self { layer: false }
    }

    /// Upsample, then layer the result over the upsampled background disparity.
    pub fn layered() -> Self {
        Self { layer: true }
    }

    /// Run the upsampler; returns the upsampled image type.
    async fn upsample(&self, ctx: &JobContext) -> WorkerResult<ImageType> {
        let msg = &ctx.msg;
        let image_type = msg.require_image_type()?;
        let upsampled = image_type
            .upsampled()
            .ok_or_else(|| WorkerError::job_failed(format!("{image_type} cannot be upsampled")))?;
        let level = msg.level;
        let dst_level = ctx.dst_level()?;

        let mut params = ctx.params();
        params.app = UPSAMPLE_BINARY.to_string();
        let mut types = vec![(image_type, level)];
        let color_type = if image_type == ImageType::Disparity {
            types.push((ImageType::ForegroundMasks, level));
            types.push((ImageType::ForegroundMasks, dst_level));
            params.set_flag("foreground_masks_in", ctx.local(ImageType::ForegroundMasks, level)?);
            params.set_flag("foreground_masks_out", ctx.local(ImageType::ForegroundMasks, dst_level)?);

            ctx.download_frames(&[(ImageType::BackgroundDisp, dst_level)], &[ctx.background_frame()?])
                .await?;
            params.set_flag("background_disp", ctx.local(ImageType::BackgroundDisp, dst_level)?);
            ImageType::Color
        } else {
            // background upsampling runs without masks
            params.clear_flag("foreground_masks_in");
            params.clear_flag("foreground_masks_out");
            ImageType::BackgroundColor
        };
        types.push((color_type, dst_level));

        ctx.download(&types).await?;
        ctx.download_rig().await?;

        params.set_flag("disparity", ctx.local(image_type, level)?);
        params.set_flag("output", ctx.local(upsampled, None)?);
        params.set_flag("color", ctx.local(color_type, dst_level)?);

        ctx.run(UPSAMPLE_BINARY, &params).await?;
        Ok(upsampled)
    }

    async fn layer_over_background(&self, ctx: &JobContext) -> WorkerResult<()> {
        let background = ctx.background_frame()?;
        ctx.download_frames(&[(ImageType::BackgroundDispUpsample, None)], &[background])
            .await?;

        let mut params = ctx.params();
        params.app = LAYER_BINARY.to_string();
        params.set_flag("background_disp", ctx.local(ImageType::BackgroundDispUpsample, None)?);
        params.set_flag("foreground_disp", ctx.local(ImageType::DisparityUpsample, None)?);
        params.set_flag("output", ctx.roots.output.to_string_lossy().into_owned());

        ctx.run(LAYER_BINARY, &params).await?;
        ctx.upload(ImageType::Disparity, None, None).await?;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for UpsampleHandler {
    fn kind(&self) -> StageKind {
        if self.layer {
            StageKind::UpsampleLayer
        } else {
            StageKind::UpsampleDisparity
        }
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        if self.layer {
            let image_type = ctx.msg.require_image_type()?;
            if image_type != ImageType::Disparity {
                return Err(WorkerError::job_failed(format!(
                    "Layering requires disparity, got {image_type}"
                )));
            }
        }

        let upsampled = self.upsample(ctx).await?;
        if self.layer {
            self.layer_over_background(ctx).await
        } else {
            ctx.upload(upsampled, None, None).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Scratch;
    use crate::testing::{fake_binary, job, local_context, recorded_args, remote_context, seed_remote, MemoryStore, RIG_JSON};
    use std::sync::Arc;
    use tempfile::TempDir;
    use vrender_models::{FrameName, LevelSpec};

    const UPSAMPLE_FLAGS: &[&str] = &[
        "app",
        "disparity",
        "output",
        "color",
        "foreground_masks_in",
        "foreground_masks_out",
        "background_disp",
        "first",
        "last",
    ];
    const LAYER_FLAGS: &[&str] = &["app", "background_disp", "foreground_disp", "output", "first", "last"];

    #[tokio::test]
    async fn test_foreground_upsample_wires_masks_and_background() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().display().to_string();
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), UPSAMPLE_BINARY, UPSAMPLE_FLAGS, "exit 0");

        let mut msg = job("UpsampleDisparity", 1, 1, &root_str);
        msg.image_type = Some(ImageType::Disparity);
        msg.level = Some(2);
        msg.dst_level = LevelSpec::One(1);
        msg.background_frame = Some(FrameName::new(100));
        UpsampleHandler::plain()
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap();

        let args = recorded_args(bin.path(), UPSAMPLE_BINARY);
        assert_eq!(args["app"], UPSAMPLE_BINARY);
        assert_eq!(args["disparity"], format!("{root_str}/output/disparity_levels/level_2"));
        assert_eq!(args["output"], format!("{root_str}/output/disparity_upsample"));
        assert_eq!(args["color"], format!("{root_str}/video/color_levels/level_1"));
        assert_eq!(args["foreground_masks_in"], format!("{root_str}/video/foreground_masks_levels/level_2"));
        assert_eq!(args["foreground_masks_out"], format!("{root_str}/video/foreground_masks_levels/level_1"));
        assert_eq!(args["background_disp"], format!("{root_str}/background/disparity_levels/level_1"));
    }

    #[tokio::test]
    async fn test_background_upsample_skips_masks() {
        let root = TempDir::new().unwrap();
        let root_str = root.path().display().to_string();
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), UPSAMPLE_BINARY, UPSAMPLE_FLAGS, "exit 0");

        let mut msg = job("UpsampleDisparity: Background", 100, 100, &root_str);
        msg.image_type = Some(ImageType::BackgroundDisp);
        msg.level = Some(1);
        msg.dst_level = LevelSpec::None;
        msg.set_flag("foreground_masks_in", "/stale/masks");
        UpsampleHandler::plain()
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap();

        let args = recorded_args(bin.path(), UPSAMPLE_BINARY);
        assert!(!args.contains_key("foreground_masks_in"));
        assert!(!args.contains_key("background_disp"));
        assert_eq!(args["color"], format!("{root_str}/background/color"));
        assert_eq!(args["output"], format!("{root_str}/background/disparity_upsample"));
    }

    #[tokio::test]
    async fn test_layered_upsample_publishes_final_disparity() {
        let store = Arc::new(MemoryStore::default());
        store.insert("b", "shot/rig.json", RIG_JSON.as_bytes());

        let mut msg = job("UpsampleLayer", 1, 1, "s3://b/shot");
        msg.image_type = Some(ImageType::Disparity);
        msg.level = Some(1);
        msg.dst_level = LevelSpec::One(0);
        msg.background_frame = Some(FrameName::new(100));

        let chunk = [FrameName::new(1)];
        let background = [FrameName::new(100)];
        let seeds = [
            (ImageType::Disparity, Some(1), "cam0/000001.pfm", &chunk),
            (ImageType::ForegroundMasks, Some(1), "cam0/000001.png", &chunk),
            (ImageType::ForegroundMasks, Some(0), "cam0/000001.png", &chunk),
            (ImageType::Color, Some(0), "cam0/000001.png", &chunk),
            (ImageType::BackgroundDisp, Some(0), "cam0/000100.pfm", &background),
            (ImageType::BackgroundDispUpsample, None, "cam0/000100.pfm", &background),
        ];
        for (image_type, level, file, frames) in seeds {
            seed_remote(&store, &msg, image_type, level, &[(file, "x")], frames).await;
        }

        let bin = TempDir::new().unwrap();
        fake_binary(
            bin.path(),
            UPSAMPLE_BINARY,
            UPSAMPLE_FLAGS,
            r#"test -f "$flag_background_disp/cam0/000100.pfm" || exit 2
mkdir -p "$flag_output/cam0"
echo u > "$flag_output/cam0/000001.pfm""#,
        );
        fake_binary(
            bin.path(),
            LAYER_BINARY,
            LAYER_FLAGS,
            r#"test -f "$flag_background_disp/cam0/000100.pfm" || exit 2
test -f "$flag_foreground_disp/cam0/000001.pfm" || exit 3
mkdir -p "$flag_output/disparity/cam0"
echo l > "$flag_output/disparity/cam0/000001.pfm""#,
        );

        let scratch_root = TempDir::new().unwrap();
        let scratch = Scratch::new(scratch_root.path());
        UpsampleHandler::layered()
            .handle(&remote_context(msg, store.clone(), &scratch, bin.path()))
            .await
            .unwrap();

        let args = recorded_args(bin.path(), LAYER_BINARY);
        assert_eq!(args["app"], LAYER_BINARY);
        assert_eq!(args["output"], scratch.output().display().to_string());
        assert!(store.get("b", "shot/output/disparity/000001.tar").is_some());
        assert!(store
            .keys("b")
            .iter()
            .all(|k| !k.starts_with("shot/output/disparity_upsample/")));
    }

    #[tokio::test]
    async fn test_layering_rejects_background_disparity() {
        let root = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let mut msg = job("UpsampleLayer", 1, 1, &root.path().display().to_string());
        msg.image_type = Some(ImageType::BackgroundDisp);
        let err = UpsampleHandler::layered()
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::JobFailed(_)), "{err}");
    }
}
