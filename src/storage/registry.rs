//! Maps persisted backend rows to live [`StorageBackend`] instances.
//!
//! Instances are cached per backend id and re-opened when the stored
//! configuration changes.

use crate::{
    models::storage_record::StorageRecord,
    services::{ServiceError, ServiceResult},
    storage::{
        BackendKind, StorageBackend, StorageResult, ftp::FtpBackend, local::LocalBackend,
        s3::S3Backend,
    },
};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Builds the live backend for a stored row.
pub type BackendOpener =
    Arc<dyn Fn(&StorageRecord) -> StorageResult<Arc<dyn StorageBackend>> + Send + Sync>;

/// Build a backend from its kind tag and serialized configuration.
pub fn open_backend(kind: BackendKind, config: &str) -> StorageResult<Arc<dyn StorageBackend>> {
    Ok(match kind {
        BackendKind::Local => Arc::new(LocalBackend::from_config(config)?),
        BackendKind::S3 => Arc::new(S3Backend::from_config(config)?),
        BackendKind::Ftp => Arc::new(FtpBackend::from_config(config)?),
    })
}

/// Default opener: the kind and configuration stored in the row.
pub fn open_record(record: &StorageRecord) -> StorageResult<Arc<dyn StorageBackend>> {
    let kind: BackendKind = record.kind.parse()?;
    open_backend(kind, &record.config)
}

struct Opened {
    config: String,
    backend: Arc<dyn StorageBackend>,
}

#[derive(Clone)]
pub struct StorageRegistry {
    db: Arc<SqlitePool>,
    opener: BackendOpener,
    cache: Arc<Mutex<HashMap<i64, Opened>>>,
}

impl StorageRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self::with_opener(db, Arc::new(open_record))
    }

    pub fn with_opener(db: Arc<SqlitePool>, opener: BackendOpener) -> Self {
        Self {
            db,
            opener,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drop the cached instance for `id`.
    pub fn evict(&self, id: i64) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&id);
        }
    }

    /// Load the backend row for `id`. A deleted backend is `NotFound`.
    pub async fn record(&self, id: i64) -> ServiceResult<StorageRecord> {
        sqlx::query_as::<_, StorageRecord>(
            "SELECT id, name, kind, config, max_size, current_size, is_default, created_at \
             FROM storages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("storage {} not found", id)))
    }

    /// Live backend for the row with `id`.
    pub async fn get(&self, id: i64) -> ServiceResult<Arc<dyn StorageBackend>> {
        let record = self.record(id).await?;
        self.open(&record)
    }

    /// Live backend for an already loaded row.
    pub fn open(&self, record: &StorageRecord) -> ServiceResult<Arc<dyn StorageBackend>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ServiceError::Internal("storage registry lock poisoned".into()))?;

        if let Some(opened) = cache.get(&record.id) {
            if opened.config == record.config {
                return Ok(opened.backend.clone());
            }
        }

        let backend = (self.opener)(record)?;
        cache.insert(
            record.id,
            Opened {
                config: record.config.clone(),
                backend: backend.clone(),
            },
        );
        Ok(backend)
    }
}
