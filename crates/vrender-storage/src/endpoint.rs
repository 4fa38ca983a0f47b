//! Endpoint address parsing.

use std::fmt;

use url::Url;

use crate::error::{StorageError, StorageResult};

const SCHEME_DELIM: &str = "://";

/// Where an endpoint's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Already visible on the local filesystem.
    Local,
    /// Network share, reachable through a local mount.
    Share,
    /// S3-compatible object store.
    ObjectStore,
}

/// A parsed `scheme://host/path` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    /// Share host or bucket name; `None` for local paths
    pub host: Option<String>,
    /// Path within the host, without a leading `/` for remote endpoints
    pub path: String,
}

impl Endpoint {
    /// Parse an address. Addresses without a scheme are local paths.
    pub fn parse(address: &str) -> StorageResult<Self> {
        let Some((_, rest)) = address.split_once(SCHEME_DELIM) else {
            return Ok(Self::local(address));
        };

        let url = Url::parse(address)
            .map_err(|e| StorageError::invalid_endpoint(format!("{address}: {e}")))?;
        let scheme = match url.scheme() {
            "file" => return Ok(Self::local(url.path())),
            "smb" => Scheme::Share,
            "s3" => Scheme::ObjectStore,
            other => {
                return Err(StorageError::invalid_endpoint(format!(
                    "{address}: unsupported scheme {other}"
                )))
            }
        };

        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(StorageError::invalid_endpoint(format!("{address}: missing host")));
        }

        Ok(Self {
            scheme,
            host: Some(host.to_string()),
            path: path.trim_end_matches('/').to_string(),
        })
    }

    fn local(path: &str) -> Self {
        let trimmed = path.trim_end_matches('/');
        Self {
            scheme: Scheme::Local,
            host: None,
            path: if trimmed.is_empty() { path.to_string() } else { trimmed.to_string() },
        }
    }

    pub fn is_object_store(&self) -> bool {
        self.scheme == Scheme::ObjectStore
    }

    /// Endpoint of `relative` below this one.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return self.clone();
        }
        let path = if self.path.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.path, relative)
        };
        Self {
            scheme: self.scheme,
            host: self.host.clone(),
            path,
        }
    }

    /// Last path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Whether the address names a single file rather than a directory.
    ///
    /// A dot in the last component marks a file.
    pub fn is_file(&self) -> bool {
        self.file_name().contains('.')
    }
}

fn scheme_name(scheme: Scheme) -> &'static str {
    match scheme {
        Scheme::Local => "",
        Scheme::Share => "smb",
        Scheme::ObjectStore => "s3",
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}://{}/{}", scheme_name(self.scheme), host, self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Join `relative` onto an address string, keeping its scheme.
pub fn join_address(address: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    let base = address.trim_end_matches('/');
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{relative}")
    }
}
