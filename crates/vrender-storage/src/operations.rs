//! Image-type level operations used by stage handlers.

use std::path::PathBuf;

use tracing::{debug, info};
use vrender_models::{FrameName, ImageType, JobMessage};

use crate::archive::{archive_name, pack_frames, unpack_archive};
use crate::client::Storage;
use crate::error::{StorageError, StorageResult};
use crate::filter::GlobFilter;
use crate::layout::{remote_image_type_path, LocalRoots};

/// Filter selecting the files of `frames`, at the top level or one camera deep.
pub fn frame_filter(frames: &[FrameName]) -> StorageResult<GlobFilter> {
    let patterns: Vec<String> = frames
        .iter()
        .flat_map(|frame| [format!("{frame}.*"), format!("*/{frame}.*")])
        .collect();
    GlobFilter::only(&patterns)
}

impl Storage {
    /// Fetch the job's rig file next to the local input root.
    pub async fn download_rig(&self, msg: &JobMessage, roots: &LocalRoots) -> StorageResult<bool> {
        let dst = roots.rig_path(msg);
        self.download(&msg.rig, &dst, &GlobFilter::only(&["*.json"])?).await
    }

    /// Fetch `frames` of `image_type` at `level` into the local roots.
    ///
    /// Packaged types are fetched as one archive per frame and unpacked in place.
    pub async fn download_image_type(
        &self,
        msg: &JobMessage,
        roots: &LocalRoots,
        image_type: ImageType,
        frames: &[FrameName],
        level: Option<u32>,
    ) -> StorageResult<bool> {
        let src = remote_image_type_path(msg, image_type, level)?;
        if !self.is_object_store(&src)? {
            return Ok(false);
        }
        let dst = roots.image_type_path(image_type, level)?;
        debug!(image_type = %image_type, ?level, frames = frames.len(), "Downloading image type");

        if image_type.is_export() {
            return self.download(&src, &dst, &frame_filter(frames)?).await;
        }

        for frame in frames {
            let name = archive_name(frame);
            let archive = dst.join(&name);
            self.download(&format!("{src}/{name}"), &archive, &GlobFilter::all())
                .await?;
            let target = dst.clone();
            tokio::task::spawn_blocking(move || {
                unpack_archive(&archive, &target)?;
                std::fs::remove_file(&archive)?;
                Ok::<_, StorageError>(())
            })
            .await
            .map_err(|e| StorageError::archive(e.to_string()))??;
        }
        Ok(true)
    }

    /// Fetch several `(image type, level)` pairs; `frames` defaults to the job's chunk.
    pub async fn download_image_types(
        &self,
        msg: &JobMessage,
        roots: &LocalRoots,
        types: &[(ImageType, Option<u32>)],
        frames: Option<&[FrameName]>,
    ) -> StorageResult<bool> {
        let chunk_frames;
        let frames = match frames {
            Some(frames) => frames,
            None => {
                chunk_frames = msg.frames();
                &chunk_frames
            }
        };

        let mut ran = false;
        for (image_type, level) in types {
            ran |= self
                .download_image_type(msg, roots, *image_type, frames, *level)
                .await?;
        }
        Ok(ran)
    }

    /// Push `frames` of `image_type` at `level` from the local roots.
    ///
    /// Exports are uploaded as plain files; every other type is packed into one
    /// archive per frame first. `frames` defaults to the job's chunk.
    pub async fn upload_image_type(
        &self,
        msg: &JobMessage,
        roots: &LocalRoots,
        image_type: ImageType,
        frames: Option<&[FrameName]>,
        level: Option<u32>,
    ) -> StorageResult<bool> {
        let dst = remote_image_type_path(msg, image_type, level)?;
        if !self.is_object_store(&dst)? {
            return Ok(false);
        }
        let frames: Vec<FrameName> = frames.map(<[FrameName]>::to_vec).unwrap_or_else(|| msg.frames());
        let src = roots.image_type_path(image_type, level)?;

        if image_type.is_export() {
            return self.upload(&src, &dst, &frame_filter(&frames)?).await;
        }

        let pack_dir = src.clone();
        let pack_list = frames.clone();
        let archives: Vec<PathBuf> = tokio::task::spawn_blocking(move || pack_frames(&pack_dir, &pack_list))
            .await
            .map_err(|e| StorageError::archive(e.to_string()))??;

        let names: Vec<String> = frames.iter().map(archive_name).collect();
        self.upload(&src, &dst, &GlobFilter::only(&names)?).await?;
        for archive in archives {
            let _ = tokio::fs::remove_file(archive).await;
        }
        info!(image_type = %image_type, ?level, frames = frames.len(), "Uploaded image type");
        Ok(true)
    }

    /// Copy frames of one image type and level to another, per camera.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_image_level(
        &self,
        msg: &JobMessage,
        src_type: ImageType,
        dst_type: ImageType,
        cameras: &[String],
        frames: &[FrameName],
        src_level: Option<u32>,
        dst_level: Option<u32>,
    ) -> StorageResult<()> {
        let src = remote_image_type_path(msg, src_type, src_level)?;
        let dst = remote_image_type_path(msg, dst_type, dst_level)?;
        debug!(src = %src, dst = %dst, frames = frames.len(), "Copying image level");
        for frame in frames {
            self.copy_frame(&src, &dst, frame, cameras).await?;
        }
        Ok(())
    }
}
