//! Frame-chunk cache checking.
//!
//! A stage's destination image type and level fully determine the file names
//! it produces, so the chunks still needing work are found by diffing the
//! expected names against a listing of the destination.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vrender_models::{FrameChunk, FrameName, ImageType, JobMessage, StageKind};
use vrender_storage::archive::archive_name;
use vrender_storage::{join_address, remote_image_type_path, Storage, StorageError};

use crate::error::PipelineResult;

/// Finds the chunks of a stage whose output is not in storage yet.
#[derive(Clone)]
pub struct CacheChecker {
    storage: Arc<Storage>,
}

impl CacheChecker {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Chunks of `chunks` with at least one frame missing at any requested level.
    ///
    /// Every chunk is returned when `force_recompute` is set or the
    /// destination cannot be inspected.
    pub async fn missing_chunks(&self, msg: &JobMessage, chunks: &[FrameChunk]) -> Vec<FrameChunk> {
        if msg.force_recompute {
            return chunks.to_vec();
        }
        let Some(span) = FrameChunk::spanning(chunks) else {
            return Vec::new();
        };

        info!(stage = %msg.app, "Checking cache");
        let frames = span.frames();
        let mut missing = BTreeSet::new();
        for level in msg.dst_level.levels() {
            match self.missing_frames(msg, level, &frames).await {
                Ok(frames) => missing.extend(frames),
                Err(e) => {
                    warn!(stage = %msg.app, ?level, "Cache state unknown, dispatching everything: {}", e);
                    return chunks.to_vec();
                }
            }
        }

        let pending: Vec<FrameChunk> = chunks
            .iter()
            .filter(|chunk| chunk.frames().iter().any(|frame| missing.contains(frame)))
            .cloned()
            .collect();
        debug!(
            stage = %msg.app,
            missing_frames = missing.len(),
            pending_chunks = pending.len(),
            "Cache checked"
        );
        pending
    }

    /// Frames of `frames` whose output at `level` is absent.
    pub async fn missing_frames(
        &self,
        msg: &JobMessage,
        level: Option<u32>,
        frames: &[FrameName],
    ) -> PipelineResult<BTreeSet<FrameName>> {
        let dst_type = msg.require_dst_image_type()?;
        let dst_dir = remote_image_type_path(msg, dst_type, level)?;

        let expected = self.expected_files(msg, dst_type, &dst_dir, frames).await?;
        let actual = self.storage.list(&dst_dir).await?;

        Ok(expected
            .into_iter()
            .filter(|(name, _)| !actual.contains(name))
            .map(|(_, frame)| frame)
            .collect())
    }

    /// Expected file names below `dst_dir`, each with the frame it belongs to.
    async fn expected_files(
        &self,
        msg: &JobMessage,
        dst_type: ImageType,
        dst_dir: &str,
        frames: &[FrameName],
    ) -> PipelineResult<Vec<(String, FrameName)>> {
        if self.storage.is_object_store(dst_dir)? && !dst_type.is_export() {
            return Ok(frames.iter().map(|f| (archive_name(f), f.clone())).collect());
        }

        let stage = msg.stage()?;
        if stage == StageKind::SimpleMeshRenderer {
            let ext = msg.file_type.as_deref().unwrap_or("png");
            return Ok(frames.iter().map(|f| (format!("{f}.{ext}"), f.clone())).collect());
        }

        let cameras = self.storage.camera_dirs(dst_dir).await?;
        let Some(sample_camera) = cameras.first() else {
            return Err(StorageError::not_found(format!("{dst_dir}/<camera>")).into());
        };

        let declared = match stage {
            StageKind::DepthEstimation | StageKind::ConvertToBinary => msg.output_extensions(),
            _ => Vec::new(),
        };
        let extensions = if declared.is_empty() {
            vec![self.sniff_extension(&join_address(dst_dir, sample_camera)).await?]
        } else {
            declared
        };

        let mut expected = Vec::with_capacity(extensions.len() * frames.len() * cameras.len());
        for ext in &extensions {
            for frame in frames {
                for camera in &cameras {
                    expected.push((format!("{camera}/{frame}.{ext}"), frame.clone()));
                }
            }
        }
        Ok(expected)
    }

    async fn sniff_extension(&self, camera_dir: &str) -> PipelineResult<String> {
        let sample = self
            .storage
            .sample_file(camera_dir)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("{camera_dir}/*")))?;
        Path::new(&sample)
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::not_found(format!("extension of {sample}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use vrender_models::LevelSpec;
    use vrender_storage::{ObjectStore, StorageResult};

    const CAMERAS: [&str; 2] = ["cam0", "cam1"];

    fn chunks(first: u32, last: u32, size: u32) -> Vec<FrameChunk> {
        FrameChunk::split(&FrameName::new(first), &FrameName::new(last), size).unwrap()
    }

    fn depth_msg(root: &Path, level: u32) -> JobMessage {
        let root = root.to_string_lossy().to_string();
        let chunk = FrameChunk::single(FrameName::new(0));
        let mut msg = JobMessage::new(
            format!("DerpCLI: Level {level}"),
            &chunk,
            root.clone(),
            format!("{root}/output"),
            format!("{root}/rig.json"),
        );
        msg.output_formats = Some("pfm".to_string());
        msg.dst_image_type = Some(ImageType::Disparity);
        msg.dst_level = LevelSpec::One(level);
        msg
    }

    fn level_dir(root: &Path, level: u32) -> PathBuf {
        root.join(format!("output/disparity_levels/level_{level}"))
    }

    fn write_frames(dir: &Path, frames: impl IntoIterator<Item = u32>) {
        for frame in frames {
            for cam in CAMERAS {
                std::fs::create_dir_all(dir.join(cam)).unwrap();
                std::fs::write(dir.join(cam).join(format!("{}.pfm", FrameName::new(frame))), b"x").unwrap();
            }
        }
    }

    fn checker() -> CacheChecker {
        CacheChecker::new(Arc::new(Storage::local_only("/mnt")))
    }

    #[tokio::test]
    async fn test_complete_destination_dispatches_nothing() {
        let dir = TempDir::new().unwrap();
        write_frames(&level_dir(dir.path(), 3), 0..10);

        let msg = depth_msg(dir.path(), 3);
        let checker = checker();
        assert!(checker.missing_chunks(&msg, &chunks(0, 9, 1)).await.is_empty());
        assert!(checker.missing_chunks(&msg, &chunks(0, 9, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_frame_marks_enclosing_chunk() {
        let dir = TempDir::new().unwrap();
        let level = level_dir(dir.path(), 3);
        write_frames(&level, (0..10).filter(|f| *f != 5));
        let msg = depth_msg(dir.path(), 3);
        let checker = checker();

        let missing = checker.missing_chunks(&msg, &chunks(0, 9, 4)).await;
        assert_eq!(missing, vec![FrameChunk::new(FrameName::new(4), FrameName::new(7)).unwrap()]);

        // One camera missing is enough
        std::fs::write(level.join("cam0/000005.pfm"), b"x").unwrap();
        let missing = checker.missing_chunks(&msg, &chunks(0, 9, 4)).await;
        assert_eq!(missing.len(), 1);

        write_frames(&level, [5]);
        assert!(checker.missing_chunks(&msg, &chunks(0, 9, 4)).await.is_empty());
    }

    #[tokio::test]
    async fn test_any_missing_level_marks_chunk() {
        let dir = TempDir::new().unwrap();
        write_frames(&level_dir(dir.path(), 0), 0..4);
        write_frames(&level_dir(dir.path(), 1), [0, 1, 3]);

        let mut msg = depth_msg(dir.path(), 0);
        msg.dst_level = LevelSpec::Many(vec![0, 1]);
        let missing = checker().missing_chunks(&msg, &chunks(0, 3, 1)).await;
        assert_eq!(missing, vec![FrameChunk::single(FrameName::new(2))]);
    }

    #[tokio::test]
    async fn test_unlistable_destination_dispatches_everything() {
        let dir = TempDir::new().unwrap();
        let msg = depth_msg(dir.path(), 3);
        let all = chunks(0, 9, 2);
        assert_eq!(checker().missing_chunks(&msg, &all).await, all);
    }

    #[tokio::test]
    async fn test_force_recompute_dispatches_everything() {
        let dir = TempDir::new().unwrap();
        write_frames(&level_dir(dir.path(), 3), 0..10);
        let mut msg = depth_msg(dir.path(), 3);
        msg.force_recompute = true;
        let all = chunks(0, 9, 3);
        assert_eq!(checker().missing_chunks(&msg, &all).await, all);
    }

    #[tokio::test]
    async fn test_sniffs_extension_for_other_stages() {
        let dir = TempDir::new().unwrap();
        let color = dir.path().join("video/color_levels/level_2");
        for cam in CAMERAS {
            std::fs::create_dir_all(color.join(cam)).unwrap();
            for frame in 0..3 {
                std::fs::write(color.join(cam).join(format!("{}.png", FrameName::new(frame))), b"x").unwrap();
            }
        }

        let mut msg = depth_msg(dir.path(), 2);
        msg.app = "Resize: Color".to_string();
        msg.dst_image_type = Some(ImageType::Color);
        msg.dst_level = LevelSpec::Many(vec![2]);
        let missing = checker().missing_chunks(&msg, &chunks(0, 3, 1)).await;
        assert_eq!(missing, vec![FrameChunk::single(FrameName::new(3))]);
    }

    struct ListingStore {
        keys: Vec<String>,
    }

    #[async_trait]
    impl ObjectStore for ListingStore {
        async fn list(&self, _bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
            Ok(self.keys.iter().filter(|k| k.starts_with(prefix)).cloned().collect())
        }

        async fn get_to_file(&self, _bucket: &str, key: &str, _path: &Path) -> StorageResult<()> {
            Err(StorageError::not_found(key))
        }

        async fn put_file(&self, _bucket: &str, key: &str, _path: &Path) -> StorageResult<()> {
            Err(StorageError::upload_failed(key))
        }

        async fn copy(&self, _bucket: &str, src_key: &str, _dst_bucket: &str, _dst_key: &str) -> StorageResult<()> {
            Err(StorageError::not_found(src_key))
        }
    }

    #[tokio::test]
    async fn test_object_store_expects_frame_archives() {
        let store = ListingStore {
            keys: vec![
                "shot/output/disparity_levels/level_3/000000.tar".to_string(),
                "shot/output/disparity_levels/level_3/000002.tar".to_string(),
            ],
        };
        let storage = Storage::with_object_store("/mnt", Arc::new(store));
        let checker = CacheChecker::new(Arc::new(storage));

        let chunk = FrameChunk::single(FrameName::new(0));
        let mut msg = JobMessage::new("DerpCLI: Level 3", &chunk, "s3://b/shot", "s3://b/shot/output", "s3://b/shot/rig.json");
        msg.dst_image_type = Some(ImageType::Disparity);
        msg.dst_level = LevelSpec::One(3);

        let missing = checker.missing_chunks(&msg, &chunks(0, 2, 1)).await;
        assert_eq!(missing, vec![FrameChunk::single(FrameName::new(1))]);
    }
}
