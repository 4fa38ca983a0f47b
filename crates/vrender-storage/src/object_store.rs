//! Object-store backend.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};

/// Minimal object-store surface used by the storage layer.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Full keys of every object under `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Download an object into `path`, creating parent directories.
    async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()>;

    /// Upload `path` as an object.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()>;

    /// Server-side copy.
    async fn copy(&self, bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> StorageResult<()>;
}

/// S3-compatible object store.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Create a client from configuration.
    ///
    /// Static credentials and a custom endpoint are used when configured,
    /// otherwise the default AWS credential chain.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let client = if let (Some(key_id), Some(secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "vrender");
            let mut builder = Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .credentials_provider(credentials);
            if let Some(endpoint) = &config.endpoint_url {
                builder = builder.endpoint_url(endpoint).force_path_style(true);
            }
            Client::from_conf(builder.build())
        } else {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()));
            if let Some(endpoint) = &config.endpoint_url {
                loader = loader.endpoint_url(endpoint);
            }
            let sdk_config = loader.load().await;
            Client::new(&sdk_config)
        };

        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        debug!("Listing s3://{}/{}", bucket, prefix);

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::list_failed(e.to_string()))?;

            if let Some(ref contents) = response.contents {
                keys.extend(contents.iter().filter_map(|obj| obj.key.clone()));
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
        debug!("Downloading s3://{}/{} to {}", bucket, key, path.display());

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::not_found(format!("s3://{bucket}/{key}"))
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::download_failed(format!("Failed to create directory: {}", e))
            })?;
        }

        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StorageError::download_failed(format!("Failed to write file: {}", e)))?;

        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
        debug!("Uploading {} to s3://{}/{}", path.display(), bucket, key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        Ok(())
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> StorageResult<()> {
        self.client
            .copy_object()
            .copy_source(format!("{bucket}/{src_key}"))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| StorageError::CopyFailed(e.to_string()))?;

        info!("Copied s3://{}/{} to s3://{}/{}", bucket, src_key, dst_bucket, dst_key);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory object store for tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryObjectStore {
        objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    }

    impl MemoryObjectStore {
        pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data.to_vec());
        }

        pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        }

        pub fn keys(&self, bucket: &str) -> Vec<String> {
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, k)| k.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
            Ok(self
                .keys(bucket)
                .into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect())
        }

        async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
            let data = self
                .get(bucket, key)
                .ok_or_else(|| StorageError::not_found(format!("s3://{bucket}/{key}")))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, data)?;
            Ok(())
        }

        async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
            let data = std::fs::read(path)?;
            self.insert(bucket, key, &data);
            Ok(())
        }

        async fn copy(&self, bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> StorageResult<()> {
            let data = self
                .get(bucket, src_key)
                .ok_or_else(|| StorageError::not_found(format!("s3://{bucket}/{src_key}")))?;
            self.insert(dst_bucket, dst_key, &data);
            Ok(())
        }
    }
}
