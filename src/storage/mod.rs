//! Pluggable destinations for finalized files.
//!
//! Every backend kind implements [`StorageBackend`]; the persisted kind tag
//! picks the implementation when a stored configuration is opened (see
//! [`registry`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::Path, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

pub mod ftp;
pub mod local;
pub mod registry;
pub mod s3;

/// Bound applied to connect, authentication and probe round trips.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StorageError {
    /// The object is gone upstream; the referencing record must be purged.
    #[error("file unavailable")]
    FileUnavailable,
    #[error("invalid storage configuration: {0}")]
    Config(String),
    /// Timeout or transport failure; worth retrying later.
    #[error("storage backend unreachable: {0}")]
    Unreachable(String),
    /// The backend answered and refused (credentials, upstream quota, ...).
    #[error("storage backend rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unreachable(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Stable tag stored next to each backend configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Ftp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Ftp => "ftp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "ftp" => Ok(BackendKind::Ftp),
            other => Err(StorageError::Config(format!("unknown storage kind `{}`", other))),
        }
    }
}

/// Where a client should fetch stored bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Readable by this process; streamed back by the HTTP layer.
    LocalPath(PathBuf),
    /// Public or presigned URL the client is redirected to.
    Url(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Copy `local_path` into the backend under a freshly generated key and
    /// return that key. A failed call removes what it wrote, best effort.
    async fn upload(&self, local_path: &Path, desired_name: &str) -> StorageResult<String>;

    /// Resolve `key` to something a client can fetch. Fails with
    /// [`StorageError::FileUnavailable`] when the object no longer exists.
    async fn download(&self, key: &str, filename: &str) -> StorageResult<DownloadTarget>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Configuration in the form persisted in `storages.config`.
    fn serialize(&self) -> String;
}

/// Parse a JSON backend configuration, naming `kind` in the error.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    kind: BackendKind,
    raw: &str,
) -> StorageResult<T> {
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Config(format!("{} config: {}", kind, err)))
}

/// Fail with a configuration error naming the first blank field.
pub(crate) fn require_fields(kind: BackendKind, fields: &[(&str, &str)]) -> StorageResult<()> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(StorageError::Config(format!(
            "{} config: `{}` must not be empty",
            kind, name
        ))),
        None => Ok(()),
    }
}

/// Reduce a user supplied filename to something safe inside an object key.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '#' | '%' | '"' | '<' | '>' | '|' | '*' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Public URL for `key` under a configured domain. Bare hosts get `https://`.
pub(crate) fn public_url(domain: &str, key: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    let encoded = encode_key(key);
    if domain.starts_with("http://") || domain.starts_with("https://") {
        format!("{}/{}", domain, encoded)
    } else {
        format!("https://{}/{}", domain, encoded)
    }
}

/// Percent-encode everything but unreserved characters and `/`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_urls_are_encoded_and_schemed() {
        assert_eq!(
            public_url("cdn.example.com/", "abc/my file.txt"),
            "https://cdn.example.com/abc/my%20file.txt"
        );
        assert_eq!(
            public_url("http://files.local", "k"),
            "http://files.local/k"
        );
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [BackendKind::Local, BackendKind::S3, BackendKind::Ftp] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!(matches!(
            "webdav".parse::<BackendKind>(),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn blank_fields_are_config_errors() {
        let err = require_fields(BackendKind::S3, &[("endpoint", "x"), ("bucket", "  ")])
            .unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn filenames_lose_path_separators() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("report 2024.pdf"), "report 2024.pdf");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn only_unreachable_is_retryable() {
        assert!(StorageError::Unreachable("timeout".into()).is_retryable());
        assert!(!StorageError::Rejected("denied".into()).is_retryable());
        assert!(!StorageError::FileUnavailable.is_retryable());
    }
}
