//! Business logic for uploads, files and storage backends.
//!
//! Services hold a shared SQLite pool and are cheap to clone; the HTTP
//! layer owns one of each inside `AppState`.

use crate::storage::StorageError;
use std::io;
use thiserror::Error;

pub mod backend_service;
pub mod file_service;
pub mod permissions;
pub mod quota;
pub mod reaper;
pub mod relocation;
pub mod sessions;
pub mod upload_service;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller input is invalid or violates a precondition; retry with a fix.
    #[error("{0}")]
    Request(String),
    /// Caller is not the owner or lacks the required permission.
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServiceError {
    pub fn request(msg: impl Into<String>) -> Self {
        ServiceError::Request(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ServiceError::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(format!("{:#}", err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Current time as unix seconds, the form every table stores.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

const MAX_FILENAME_CHARS: usize = 128;

/// Trim `name` and check it is usable as a stored filename.
pub(crate) fn validate_filename(name: &str) -> ServiceResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::request("filename must not be empty"));
    }
    if name.chars().count() > MAX_FILENAME_CHARS {
        return Err(ServiceError::request(format!(
            "filename must be at most {} characters",
            MAX_FILENAME_CHARS
        )));
    }
    Ok(name.to_string())
}
