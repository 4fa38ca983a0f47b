//! Storage configuration.

use std::path::PathBuf;

/// Configuration for the storage backends.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Custom S3 API endpoint (MinIO, R2, ...); AWS when unset
    pub endpoint_url: Option<String>,
    /// Static access key ID; the default credential chain is used when unset
    pub access_key_id: Option<String>,
    /// Static secret access key
    pub secret_access_key: Option<String>,
    pub region: String,
    /// Directory under which `smb://host/path` shares are mounted as `<root>/host/path`
    pub share_mount_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            region: "us-east-1".to_string(),
            share_mount_root: PathBuf::from("/mnt"),
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint_url: non_empty_var("S3_ENDPOINT_URL"),
            access_key_id: non_empty_var("S3_ACCESS_KEY_ID"),
            secret_access_key: non_empty_var("S3_SECRET_ACCESS_KEY"),
            region: non_empty_var("S3_REGION").unwrap_or(defaults.region),
            share_mount_root: non_empty_var("SHARE_MOUNT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.share_mount_root),
        }
    }

    /// Whether static credentials are configured.
    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
