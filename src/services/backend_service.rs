//! Registration and accounting for storage backends.

use crate::{
    models::storage_record::{StorageRecord, StorageView},
    services::{ServiceError, ServiceResult, now_ts, permissions::UploadPermissions},
    storage::{
        BackendKind, StorageError,
        local::LocalBackend,
        registry::{StorageRegistry, open_backend},
    },
};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const MIB: i64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStorageRequest {
    pub name: String,
    pub kind: BackendKind,
    /// Kind-specific settings, validated by the backend itself.
    pub config: serde_json::Value,
    /// Capacity in MiB; 0 means unlimited.
    #[serde(default)]
    pub max_size_in_mb: i64,
}

#[derive(Clone)]
pub struct BackendService {
    db: Arc<SqlitePool>,
    registry: StorageRegistry,
    permissions: Arc<dyn UploadPermissions>,
}

impl BackendService {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: StorageRegistry,
        permissions: Arc<dyn UploadPermissions>,
    ) -> Self {
        Self {
            db,
            registry,
            permissions,
        }
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    async fn ensure_admin(&self, user_id: i64) -> ServiceResult<()> {
        if !self.permissions.is_admin(user_id).await? {
            return Err(ServiceError::unauthorized("only admins can manage storage"));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        user_id: i64,
        req: CreateStorageRequest,
    ) -> ServiceResult<StorageView> {
        self.ensure_admin(user_id).await?;

        let name = req.name.trim();
        if name.is_empty() {
            return Err(ServiceError::request("storage name must not be empty"));
        }
        if req.max_size_in_mb < 0 {
            return Err(ServiceError::request("maximum size must not be negative"));
        }

        let raw = req.config.to_string();
        let backend = open_backend(req.kind, &raw).map_err(config_to_request)?;
        if req.kind == BackendKind::Local {
            LocalBackend::from_config(&raw)
                .map_err(config_to_request)?
                .ensure_root()
                .await?;
        }

        let record = sqlx::query_as::<_, StorageRecord>(
            "INSERT INTO storages (name, kind, config, max_size, current_size, is_default, \
             created_at) VALUES (?, ?, ?, ?, 0, 0, ?) \
             RETURNING id, name, kind, config, max_size, current_size, is_default, created_at",
        )
        .bind(name)
        .bind(req.kind.as_str())
        .bind(backend.serialize())
        .bind(req.max_size_in_mb.saturating_mul(MIB))
        .bind(now_ts())
        .fetch_one(&*self.db)
        .await?;

        info!(storage_id = record.id, kind = %req.kind, "storage backend registered");
        Ok(record.view())
    }

    pub async fn list(&self) -> ServiceResult<Vec<StorageView>> {
        let records = sqlx::query_as::<_, StorageRecord>(
            "SELECT id, name, kind, config, max_size, current_size, is_default, created_at \
             FROM storages ORDER BY id",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(records.iter().map(StorageRecord::view).collect())
    }

    pub async fn delete(&self, user_id: i64, id: i64) -> ServiceResult<()> {
        self.ensure_admin(user_id).await?;
        let result = sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("storage {} not found", id)));
        }
        self.registry.evict(id);
        info!(storage_id = id, "storage backend deleted");
        Ok(())
    }

    /// Make `id` the only default backend.
    pub async fn set_default(&self, user_id: i64, id: i64) -> ServiceResult<()> {
        self.ensure_admin(user_id).await?;
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE storages SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE storages SET is_default = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("storage {} not found", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn default_id(&self) -> ServiceResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM storages WHERE is_default = 1")
            .fetch_optional(&*self.db)
            .await?;
        Ok(id)
    }

    /// Apply `delta` bytes to the usage counter of backend `id` under the
    /// row's write lock. Growth past a non-zero capacity is refused; shrinking
    /// stops at zero.
    pub async fn add_usage(&self, id: i64, delta: i64) -> ServiceResult<()> {
        let mut tx = self.db.begin().await?;
        let touched = sqlx::query("UPDATE storages SET current_size = current_size WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("storage {} not found", id)));
        }

        let (max_size, current_size): (i64, i64) =
            sqlx::query_as("SELECT max_size, current_size FROM storages WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

        let next = current_size.saturating_add(delta);
        if delta > 0 && max_size > 0 && next > max_size {
            return Err(ServiceError::request(format!(
                "storage {} does not have enough free space",
                id
            )));
        }

        sqlx::query("UPDATE storages SET current_size = ? WHERE id = ?")
            .bind(next.max(0))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn config_to_request(err: StorageError) -> ServiceError {
    match err {
        StorageError::Config(msg) => ServiceError::Request(msg),
        other => ServiceError::Storage(other),
    }
}
