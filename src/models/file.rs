//! Permanent file records produced by finalized uploads or redirects.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Row of the `files` table.
///
/// Exactly one of `storage_id` and `redirect_url` is set. While relocation is
/// still running `storage_key` is empty.
#[derive(Debug, Clone, FromRow)]
pub struct PersistedFile {
    pub id: i64,
    pub public_id: String,
    pub filename: String,
    pub description: String,
    pub size: i64,
    pub content_hash: String,
    pub user_id: i64,
    pub resource_id: i64,
    pub storage_id: Option<i64>,
    pub storage_key: String,
    pub redirect_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PersistedFile {
    pub fn is_redirect(&self) -> bool {
        self.redirect_url.is_some()
    }

    /// Stored bytes are retrievable (or the file points elsewhere).
    pub fn is_available(&self) -> bool {
        self.is_redirect() || !self.storage_key.is_empty()
    }

    pub fn view(&self) -> FileView {
        FileView {
            id: self.public_id.clone(),
            filename: self.filename.clone(),
            description: self.description.clone(),
            size: self.size,
            content_hash: self.content_hash.clone(),
            user_id: self.user_id,
            resource_id: self.resource_id,
            is_redirect: self.is_redirect(),
            available: self.is_available(),
            created_at: DateTime::from_timestamp(self.created_at, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    /// Public identifier; the internal row id is never exposed.
    pub id: String,
    pub filename: String,
    pub description: String,
    pub size: i64,
    pub content_hash: String,
    pub user_id: i64,
    pub resource_id: i64,
    pub is_redirect: bool,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    pub files: Vec<FileView>,
    pub page: i64,
    pub total_pages: i64,
}

/// Fresh opaque identifier: 16 random bytes, URL-safe base64.
pub fn new_public_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}
