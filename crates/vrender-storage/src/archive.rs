//! Per-frame tar archives.
//!
//! Frames of packaged image types travel as one `<frame>.tar` holding
//! `<camera>/<frame>.<ext>` for every camera, so a transfer costs one round
//! trip per frame instead of one per camera.

use std::fs::File;
use std::path::{Path, PathBuf};

use tar::{Archive, Builder as TarBuilder};
use tracing::debug;
use vrender_models::FrameName;

use crate::error::{StorageError, StorageResult};

pub const ARCHIVE_EXT: &str = "tar";

/// File name of a frame's archive.
pub fn archive_name(frame: &FrameName) -> String {
    format!("{frame}.{ARCHIVE_EXT}")
}

/// Every regular file below `dir`, relative to it, sorted. Hidden files are skipped.
pub fn walk_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Build `<dir>/<frame>.tar` from every file below `dir` whose name contains the frame.
pub fn pack_frame(dir: &Path, frame: &FrameName) -> StorageResult<PathBuf> {
    let archive_path = dir.join(archive_name(frame));
    let members: Vec<PathBuf> = walk_files(dir)?
        .into_iter()
        .filter(|relative| {
            let name = relative.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            name.contains(frame.as_str()) && relative.extension().map_or(true, |ext| ext != ARCHIVE_EXT)
        })
        .collect();

    let file = File::create(&archive_path).map_err(|e| {
        StorageError::archive(format!("Failed to create {}: {}", archive_path.display(), e))
    })?;
    let mut tar = TarBuilder::new(file);
    for relative in &members {
        let mut member = File::open(dir.join(relative))?;
        tar.append_file(relative, &mut member).map_err(|e| {
            StorageError::archive(format!("Failed to add {} to archive: {}", relative.display(), e))
        })?;
    }
    tar.finish()
        .map_err(|e| StorageError::archive(format!("Failed to finalize archive: {}", e)))?;

    debug!(archive = %archive_path.display(), members = members.len(), "Packed frame");
    Ok(archive_path)
}

/// Pack every frame in `frames`.
pub fn pack_frames(dir: &Path, frames: &[FrameName]) -> StorageResult<Vec<PathBuf>> {
    frames.iter().map(|frame| pack_frame(dir, frame)).collect()
}

/// Extract `archive` into `dst`.
pub fn unpack_archive(archive: &Path, dst: &Path) -> StorageResult<()> {
    let file = File::open(archive).map_err(|e| {
        StorageError::archive(format!("Failed to open {}: {}", archive.display(), e))
    })?;
    std::fs::create_dir_all(dst)?;
    Archive::new(file).unpack(dst).map_err(|e| {
        StorageError::archive(format!("Failed to unpack {}: {}", archive.display(), e))
    })?;
    debug!(archive = %archive.display(), dst = %dst.display(), "Unpacked archive");
    Ok(())
}
