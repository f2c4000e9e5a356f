//! Registered storage destinations (`storages` table).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct StorageRecord {
    pub id: i64,
    pub name: String,
    /// Backend kind tag, see `storage::BackendKind`.
    pub kind: String,
    /// Serialized backend configuration, credentials included.
    pub config: String,
    /// Capacity in bytes; 0 means unlimited.
    pub max_size: i64,
    pub current_size: i64,
    pub is_default: bool,
    pub created_at: i64,
}

impl StorageRecord {
    /// Bytes still available, `None` when unlimited.
    pub fn remaining(&self) -> Option<i64> {
        (self.max_size > 0).then(|| (self.max_size - self.current_size).max(0))
    }

    pub fn view(&self) -> StorageView {
        StorageView {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            max_size: self.max_size,
            current_size: self.current_size,
            is_default: self.is_default,
            created_at: DateTime::from_timestamp(self.created_at, 0).unwrap_or_default(),
        }
    }
}

/// Listing form; configuration and credentials are never returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageView {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub max_size: i64,
    pub current_size: i64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}
