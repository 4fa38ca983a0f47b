use std::path::Path;

use async_trait::async_trait;
use tracing::warn;
use vrender_models::{FrameName, ModelError, StageKind};

use crate::context::JobContext;
use crate::dispatch::StageHandler;
use crate::error::{WorkerError, WorkerResult};

/// Builds the level pyramid of one full-size image type.
pub struct ResizeHandler;

/// Whether `dir` holds a file named `<frame>.<ext>`.
fn has_frame(dir: &Path, frame: &FrameName) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                Path::new(&entry.file_name())
                    .file_stem()
                    .is_some_and(|stem| stem == frame.as_str())
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl StageHandler for ResizeHandler {
    fn kind(&self) -> StageKind {
        StageKind::Resize
    }

    async fn handle(&self, ctx: &JobContext) -> WorkerResult<()> {
        let image_type = ctx.msg.require_image_type()?;
        let leveled = image_type
            .leveled()
            .ok_or_else(|| ModelError::NotLeveled(image_type.to_string()))?;

        ctx.download(&[(image_type, None)]).await?;
        let rig = ctx.load_rig().await?;

        let src = ctx.local_path(image_type, None)?;
        let frames = ctx.msg.frames();
        let missing: Vec<String> = rig
            .camera_ids()
            .iter()
            .flat_map(|camera| {
                let dir = src.join(camera);
                frames
                    .iter()
                    .filter(move |frame| !has_frame(&dir, frame))
                    .map(move |frame| format!("{camera}/{frame}"))
            })
            .collect();
        if !missing.is_empty() {
            warn!(image_type = %image_type, missing = missing.len(), "Resize inputs missing");
            return Err(WorkerError::missing_input(format!(
                "{} has no {}",
                src.display(),
                missing.join(", ")
            )));
        }

        let mut params = ctx.params();
        params.set_flag("src_dir", ctx.local(image_type, None)?);
        params.set_flag("dst_dir", ctx.local(leveled, None)?);
        ctx.run_stage(&params).await?;

        for level in ctx.msg.dst_level.levels() {
            ctx.upload(image_type, None, level).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_binary, job, local_context, recorded_args, write_file, RIG_JSON};
    use tempfile::TempDir;
    use vrender_models::{ImageType, LevelSpec};

    const FLAGS: &[&str] = &["src_dir", "dst_dir", "first", "last", "threshold"];

    fn shot(frames: &[(&str, &str)]) -> TempDir {
        let root = TempDir::new().unwrap();
        write_file(&root.path().join("rig.json"), RIG_JSON);
        for (camera, frame) in frames {
            write_file(&root.path().join(format!("video/color/{camera}/{frame}.png")), "px");
        }
        root
    }

    #[tokio::test]
    async fn test_resize_passes_full_size_and_pyramid_dirs() {
        let root = shot(&[("cam0", "000001"), ("cam1", "000001")]);
        let root_str = root.path().display().to_string();
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "Resize", FLAGS, "exit 0");

        let mut msg = job("Resize: Color", 1, 1, &root_str);
        msg.image_type = Some(ImageType::Color);
        msg.dst_level = LevelSpec::Many(vec![0, 1]);
        msg.threshold = Some(3);
        ResizeHandler.handle(&local_context(msg, bin.path())).await.unwrap();

        let args = recorded_args(bin.path(), "Resize");
        assert_eq!(args["src_dir"], format!("{root_str}/video/color"));
        assert_eq!(args["dst_dir"], format!("{root_str}/video/color_levels"));
        assert_eq!(args["threshold"], "3");
    }

    #[tokio::test]
    async fn test_missing_camera_frame_fails_before_running() {
        let root = shot(&[("cam0", "000001"), ("cam0", "000002"), ("cam1", "000001")]);
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "Resize", FLAGS, "exit 0");

        let mut msg = job("Resize: Color", 1, 2, &root.path().display().to_string());
        msg.image_type = Some(ImageType::Color);
        let err = ResizeHandler
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::MissingInput(ref m) if m.contains("cam1/000002")), "{err}");
        assert!(!bin.path().join("Resize.args").exists());
    }

    #[tokio::test]
    async fn test_unleveled_type_is_rejected() {
        let root = shot(&[]);
        let bin = TempDir::new().unwrap();
        let mut msg = job("Resize: Bin", 1, 1, &root.path().display().to_string());
        msg.image_type = Some(ImageType::Bin);
        let err = ResizeHandler
            .handle(&local_context(msg, bin.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Model(ModelError::NotLeveled(_))), "{err}");
    }

    #[test]
    fn test_has_frame_matches_stem_only() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("000001.png"), "px");
        assert!(has_frame(dir.path(), &FrameName::new(1)));
        assert!(!has_frame(dir.path(), &FrameName::new(10)));
        assert!(!has_frame(&dir.path().join("absent"), &FrameName::new(1)));
    }
}
