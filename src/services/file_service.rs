//! Operations on persisted files: lookup, edits, deletion and download
//! resolution, plus the row-level helpers the upload pipeline uses.

use crate::{
    models::file::{FilePage, FileView, PersistedFile, new_public_id},
    services::{
        ServiceError, ServiceResult, backend_service::BackendService, now_ts,
        permissions::UploadPermissions, validate_filename,
    },
    storage::{DownloadTarget, StorageError},
};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};

const FILE_COLUMNS: &str = "id, public_id, filename, description, size, content_hash, user_id, \
     resource_id, storage_id, storage_key, redirect_url, created_at, updated_at";

pub const PAGE_SIZE: i64 = 20;

/// Values for a file row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub filename: String,
    pub description: String,
    pub size: i64,
    pub content_hash: String,
    pub user_id: i64,
    pub resource_id: i64,
    pub storage_id: Option<i64>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRedirectRequest {
    pub filename: String,
    #[serde(default)]
    pub description: String,
    pub resource_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileRequest {
    pub filename: Option<String>,
    pub description: Option<String>,
}

/// Resolved download for a file.
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub target: DownloadTarget,
}

#[derive(Clone)]
pub struct FileService {
    db: Arc<SqlitePool>,
    backends: BackendService,
    permissions: Arc<dyn UploadPermissions>,
    allow_normal_user_upload: bool,
}

impl FileService {
    pub fn new(
        db: Arc<SqlitePool>,
        backends: BackendService,
        permissions: Arc<dyn UploadPermissions>,
        allow_normal_user_upload: bool,
    ) -> Self {
        Self {
            db,
            backends,
            permissions,
            allow_normal_user_upload,
        }
    }

    pub(crate) async fn insert(&self, new: &NewFile) -> ServiceResult<PersistedFile> {
        let now = now_ts();
        let file = sqlx::query_as::<_, PersistedFile>(&format!(
            "INSERT INTO files (public_id, filename, description, size, content_hash, user_id, \
             resource_id, storage_id, storage_key, redirect_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, '', ?, ?, ?) RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(new_public_id())
        .bind(&new.filename)
        .bind(&new.description)
        .bind(new.size)
        .bind(&new.content_hash)
        .bind(new.user_id)
        .bind(new.resource_id)
        .bind(new.storage_id)
        .bind(&new.redirect_url)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(file)
    }

    /// Record where relocation stored the bytes; false if the row is gone.
    pub(crate) async fn set_storage_key(&self, id: i64, key: &str) -> ServiceResult<bool> {
        let result =
            sqlx::query("UPDATE files SET storage_key = ?, updated_at = ? WHERE id = ?")
                .bind(key)
                .bind(now_ts())
                .bind(id)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn delete_row(&self, id: i64) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete row `id` only while its storage key still equals `key`.
    async fn delete_row_with_key(&self, id: i64, key: &str) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND storage_key = ?")
            .bind(id)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find(&self, public_id: &str) -> ServiceResult<PersistedFile> {
        sqlx::query_as::<_, PersistedFile>(&format!(
            "SELECT {} FROM files WHERE public_id = ?",
            FILE_COLUMNS
        ))
        .bind(public_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::not_found("file not found"))
    }

    pub async fn get(&self, public_id: &str) -> ServiceResult<FileView> {
        Ok(self.find(public_id).await?.view())
    }

    async fn ensure_owner_or_admin(&self, file: &PersistedFile, user_id: i64) -> ServiceResult<()> {
        if file.user_id == user_id || self.permissions.is_admin(user_id).await? {
            return Ok(());
        }
        Err(ServiceError::unauthorized(
            "only the owner or an admin can modify this file",
        ))
    }

    /// Register a file whose bytes live at an external URL.
    pub async fn create_redirect(
        &self,
        user_id: i64,
        req: CreateRedirectRequest,
    ) -> ServiceResult<FileView> {
        let filename = validate_filename(&req.filename)?;
        let can_upload = self.permissions.can_user_upload(user_id).await?;
        if !can_upload && !self.allow_normal_user_upload {
            return Err(ServiceError::unauthorized(
                "user does not have permission to upload files",
            ));
        }

        let url = req.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ServiceError::request("redirect url must be http or https"));
        }

        let file = self
            .insert(&NewFile {
                filename,
                description: req.description,
                size: 0,
                content_hash: String::new(),
                user_id,
                resource_id: req.resource_id,
                storage_id: None,
                redirect_url: Some(url.to_string()),
            })
            .await?;
        info!(file_id = %file.public_id, user_id, "redirect file created");
        Ok(file.view())
    }

    pub async fn update(
        &self,
        user_id: i64,
        public_id: &str,
        req: UpdateFileRequest,
    ) -> ServiceResult<FileView> {
        let file = self.find(public_id).await?;
        self.ensure_owner_or_admin(&file, user_id).await?;

        let filename = match req.filename {
            Some(name) => validate_filename(&name)?,
            None => file.filename.clone(),
        };
        let description = req.description.unwrap_or_else(|| file.description.clone());

        let updated = sqlx::query_as::<_, PersistedFile>(&format!(
            "UPDATE files SET filename = ?, description = ?, updated_at = ? WHERE id = ? \
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(&filename)
        .bind(&description)
        .bind(now_ts())
        .bind(file.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::not_found("file not found"))?;
        Ok(updated.view())
    }

    /// Delete the stored object (if any), its usage, then the record.
    pub async fn delete(&self, user_id: i64, public_id: &str) -> ServiceResult<()> {
        let mut file = self.find(public_id).await?;
        self.ensure_owner_or_admin(&file, user_id).await?;

        if file.storage_key.is_empty() {
            // Only removed while the key is still unset; relocation then finds
            // the row gone and cleans up its own object and usage.
            if self.delete_row_with_key(file.id, "").await? {
                info!(file_id = %file.public_id, user_id, "file deleted");
                return Ok(());
            }
            // Relocation recorded the key in the meantime.
            file = self.find(public_id).await?;
        }

        self.delete_stored(&file).await?;
        info!(file_id = %file.public_id, user_id, "file deleted");
        Ok(())
    }

    /// Remove the backend object of a relocated file, then claim the row.
    /// Usage is reverted only by the caller that removed the row.
    async fn delete_stored(&self, file: &PersistedFile) -> ServiceResult<()> {
        let Some(storage_id) = file.storage_id else {
            self.delete_row(file.id).await?;
            return Ok(());
        };

        let backend_present = match self.backends.registry().get(storage_id).await {
            Ok(backend) => {
                backend.delete(&file.storage_key).await?;
                true
            }
            Err(ServiceError::NotFound(_)) => {
                warn!(storage_id, file_id = %file.public_id, "storage gone, dropping record only");
                false
            }
            Err(err) => return Err(err),
        };

        if !self.delete_row_with_key(file.id, &file.storage_key).await? {
            return Err(ServiceError::not_found("file not found"));
        }
        if backend_present {
            self.backends.add_usage(storage_id, -file.size).await?;
        }
        Ok(())
    }

    /// Resolve where the bytes of `public_id` can be fetched.
    ///
    /// If the backend lost the object the record is purged and `NotFound`
    /// returned, so the database and the backend agree again.
    pub async fn download(&self, public_id: &str) -> ServiceResult<Download> {
        let file = self.find(public_id).await?;
        if let Some(url) = &file.redirect_url {
            return Ok(Download {
                filename: file.filename.clone(),
                target: DownloadTarget::Url(url.clone()),
            });
        }

        let storage_id = file
            .storage_id
            .ok_or_else(|| ServiceError::Internal(format!("file {} has no storage", file.id)))?;
        if file.storage_key.is_empty() {
            return Err(ServiceError::request(
                "file is not available, please try again later",
            ));
        }

        let backend = self.backends.registry().get(storage_id).await?;
        match backend.download(&file.storage_key, &file.filename).await {
            Ok(target) => Ok(Download {
                filename: file.filename,
                target,
            }),
            Err(StorageError::FileUnavailable) => {
                warn!(file_id = %file.public_id, storage_id, "stored object missing, purging record");
                if self.delete_row(file.id).await? {
                    if let Err(err) = self.backends.add_usage(storage_id, -file.size).await {
                        error!(storage_id, %err, "failed to revert storage usage");
                    }
                }
                Err(ServiceError::not_found("file not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Files uploaded by `user_id`, newest first. Pages start at 1.
    pub async fn list_user_files(&self, user_id: i64, page: i64) -> ServiceResult<FilePage> {
        let page = page.max(1);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&*self.db)
            .await?;

        let files = sqlx::query_as::<_, PersistedFile>(&format!(
            "SELECT {} FROM files WHERE user_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            FILE_COLUMNS
        ))
        .bind(user_id)
        .bind(PAGE_SIZE)
        .bind((page - 1) * PAGE_SIZE)
        .fetch_all(&*self.db)
        .await?;

        Ok(FilePage {
            files: files.iter().map(PersistedFile::view).collect(),
            page,
            total_pages: (total + PAGE_SIZE - 1) / PAGE_SIZE,
        })
    }
}
