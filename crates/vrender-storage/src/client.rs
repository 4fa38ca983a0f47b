//! Storage client dispatching on endpoint scheme.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use vrender_models::FrameName;

use crate::archive::{archive_name, walk_files};
use crate::config::StorageConfig;
use crate::endpoint::{Endpoint, Scheme};
use crate::error::{StorageError, StorageResult};
use crate::filter::GlobFilter;
use crate::object_store::{ObjectStore, S3ObjectStore};

/// Where an endpoint resolves to on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Path on the local filesystem (plain or mounted share).
    Local(PathBuf),
    /// Object-store prefix or key.
    Object { bucket: String, key: String },
}

/// Uniform access to local, share and object-store endpoints.
#[derive(Clone)]
pub struct Storage {
    share_mount_root: PathBuf,
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl Storage {
    /// Storage without an object-store backend.
    pub fn local_only(share_mount_root: impl Into<PathBuf>) -> Self {
        Self {
            share_mount_root: share_mount_root.into(),
            object_store: None,
        }
    }

    /// Storage backed by an explicit object store.
    pub fn with_object_store(share_mount_root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            share_mount_root: share_mount_root.into(),
            object_store: Some(store),
        }
    }

    /// Create from configuration with an S3 backend.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let store = S3ObjectStore::new(config).await?;
        Ok(Self::with_object_store(config.share_mount_root.clone(), Arc::new(store)))
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        Self::new(&StorageConfig::from_env()).await
    }

    /// Storage for a fixed set of addresses; the S3 backend is only built when
    /// one of them lives on the object store.
    pub async fn for_addresses<S: AsRef<str>>(config: &StorageConfig, addresses: &[S]) -> StorageResult<Self> {
        let mut needs_store = false;
        for address in addresses {
            needs_store |= Endpoint::parse(address.as_ref())?.is_object_store();
        }
        if needs_store {
            Self::new(config).await
        } else {
            Ok(Self::local_only(config.share_mount_root.clone()))
        }
    }

    fn store(&self) -> StorageResult<&Arc<dyn ObjectStore>> {
        self.object_store
            .as_ref()
            .ok_or_else(|| StorageError::config_error("No object store configured"))
    }

    /// Resolve an address to a local path or an object location.
    pub fn resolve(&self, address: &str) -> StorageResult<Location> {
        let endpoint = Endpoint::parse(address)?;
        Ok(match endpoint.scheme {
            Scheme::Local => Location::Local(PathBuf::from(&endpoint.path)),
            Scheme::Share => {
                let host = endpoint.host.unwrap_or_default();
                Location::Local(self.share_mount_root.join(host).join(&endpoint.path))
            }
            Scheme::ObjectStore => Location::Object {
                bucket: endpoint.host.unwrap_or_default(),
                key: endpoint.path,
            },
        })
    }

    /// Local path of an address, if it is not on an object store.
    pub fn local_path(&self, address: &str) -> StorageResult<Option<PathBuf>> {
        Ok(match self.resolve(address)? {
            Location::Local(path) => Some(path),
            Location::Object { .. } => None,
        })
    }

    /// Whether an address already exists on the local filesystem.
    pub fn is_locally_visible(&self, address: &str) -> bool {
        matches!(self.local_path(address), Ok(Some(path)) if path.exists())
    }

    /// Whether transfers to `address` go through the object store.
    pub fn is_object_store(&self, address: &str) -> StorageResult<bool> {
        Ok(Endpoint::parse(address)?.is_object_store())
    }

    /// Download `src` into `dst`.
    ///
    /// A no-op returning `false` unless `src` is on the object store. Addresses whose
    /// last component has an extension are single files, anything else is a
    /// directory filtered by `filter`.
    pub async fn download(&self, src: &str, dst: &Path, filter: &GlobFilter) -> StorageResult<bool> {
        let Location::Object { bucket, key } = self.resolve(src)? else {
            return Ok(false);
        };
        let store = self.store()?;
        debug!(src, dst = %dst.display(), "Downloading");

        if Endpoint::parse(src)?.is_file() {
            store.get_to_file(&bucket, &key, dst).await?;
            return Ok(true);
        }

        let prefix = dir_prefix(&key);
        let mut count = 0usize;
        for object_key in store.list(&bucket, &prefix).await? {
            let Some(relative) = object_key.strip_prefix(&prefix) else {
                continue;
            };
            if relative.is_empty() || relative.ends_with('/') || !filter.matches(relative) {
                continue;
            }
            store.get_to_file(&bucket, &object_key, &dst.join(relative)).await?;
            count += 1;
        }
        info!(src, files = count, "Downloaded from object store");
        Ok(true)
    }

    /// Upload `src` to `dst`; the mirror of [`Storage::download`].
    pub async fn upload(&self, src: &Path, dst: &str, filter: &GlobFilter) -> StorageResult<bool> {
        let Location::Object { bucket, key } = self.resolve(dst)? else {
            return Ok(false);
        };
        let store = self.store()?;
        debug!(src = %src.display(), dst, "Uploading");

        if Endpoint::parse(dst)?.is_file() {
            store.put_file(&bucket, &key, src).await?;
            return Ok(true);
        }

        let prefix = dir_prefix(&key);
        let files = walk_files(src)?;
        let mut count = 0usize;
        for relative in files {
            let relative = relative_str(&relative);
            if !filter.matches(&relative) {
                continue;
            }
            store
                .put_file(&bucket, &format!("{prefix}{relative}"), &src.join(&relative))
                .await?;
            count += 1;
        }
        info!(dst, files = count, "Uploaded to object store");
        Ok(true)
    }

    /// Relative paths of every file below `address`.
    ///
    /// Fails when a local directory does not exist.
    pub async fn list(&self, address: &str) -> StorageResult<BTreeSet<String>> {
        match self.resolve(address)? {
            Location::Local(path) => {
                if !path.is_dir() {
                    return Err(StorageError::not_found(path.display().to_string()));
                }
                Ok(walk_files(&path)?.iter().map(|p| relative_str(p)).collect())
            }
            Location::Object { bucket, key } => {
                let prefix = dir_prefix(&key);
                let keys = self.store()?.list(&bucket, &prefix).await?;
                Ok(keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .filter(|rel| !rel.is_empty() && !rel.ends_with('/'))
                    .filter(|rel| !rel.rsplit('/').next().unwrap_or_default().starts_with('.'))
                    .map(str::to_string)
                    .collect())
            }
        }
    }

    /// One file below `address`, relative to it, if any exists.
    pub async fn sample_file(&self, address: &str) -> StorageResult<Option<String>> {
        Ok(self.list(address).await?.into_iter().next())
    }

    /// Immediate subdirectories of `address` (one per camera), sorted.
    pub async fn camera_dirs(&self, address: &str) -> StorageResult<Vec<String>> {
        if let Location::Local(path) = self.resolve(address)? {
            let mut dirs = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type()?.is_dir() && !name.starts_with('.') {
                    dirs.push(name);
                }
            }
            dirs.sort();
            return Ok(dirs);
        }

        let dirs: BTreeSet<String> = self
            .list(address)
            .await?
            .iter()
            .filter_map(|rel| rel.split_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        Ok(dirs.into_iter().collect())
    }

    /// Copy one frame of every camera from `src` to `dst`.
    ///
    /// Object stores copy the frame archive server-side; local directories copy
    /// `<camera>/<frame>.*` for each camera.
    pub async fn copy_frame(
        &self,
        src: &str,
        dst: &str,
        frame: &FrameName,
        cameras: &[String],
    ) -> StorageResult<()> {
        match (self.resolve(src)?, self.resolve(dst)?) {
            (
                Location::Object { bucket, key },
                Location::Object {
                    bucket: dst_bucket,
                    key: dst_key,
                },
            ) => {
                let name = archive_name(frame);
                self.store()?
                    .copy(
                        &bucket,
                        &format!("{}{}", dir_prefix(&key), name),
                        &dst_bucket,
                        &format!("{}{}", dir_prefix(&dst_key), name),
                    )
                    .await
            }
            (Location::Local(src), Location::Local(dst)) => {
                let frame_prefix = format!("{frame}.");
                for camera in cameras {
                    let src_cam = src.join(camera);
                    let dst_cam = dst.join(camera);
                    tokio::fs::create_dir_all(&dst_cam).await?;
                    let mut entries = tokio::fs::read_dir(&src_cam).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if name.starts_with(&frame_prefix) {
                            tokio::fs::copy(entry.path(), dst_cam.join(&name)).await?;
                        }
                    }
                }
                Ok(())
            }
            _ => Err(StorageError::unsupported(format!(
                "copy between different endpoint kinds: {src} -> {dst}"
            ))),
        }
    }
}

/// `key` as a directory prefix ending in `/`.
fn dir_prefix(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Relative path with `/` separators.
fn relative_str(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
