//! Shared application state handed to every handler.

use crate::{
    config::UploadSettings,
    services::{
        backend_service::BackendService, file_service::FileService,
        permissions::UploadPermissions, quota::QuotaTracker, relocation::Relocator,
        sessions::SessionStore, upload_service::UploadService,
    },
    storage::registry::StorageRegistry,
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    /// Root for session blocks and assembled files.
    pub storage_dir: PathBuf,
    pub uploads: UploadService,
    pub files: FileService,
    pub backends: BackendService,
}

impl AppState {
    /// Wire every service on top of one pool.
    pub fn new(
        db: Arc<SqlitePool>,
        storage_dir: impl Into<PathBuf>,
        settings: UploadSettings,
        permissions: Arc<dyn UploadPermissions>,
    ) -> Self {
        let registry = StorageRegistry::new(db.clone());
        Self::with_registry(db, storage_dir, settings, permissions, registry)
    }

    /// Like [`AppState::new`] with a caller-built backend registry.
    pub fn with_registry(
        db: Arc<SqlitePool>,
        storage_dir: impl Into<PathBuf>,
        settings: UploadSettings,
        permissions: Arc<dyn UploadPermissions>,
        registry: StorageRegistry,
    ) -> Self {
        let storage_dir = storage_dir.into();
        let backends = BackendService::new(db.clone(), registry, permissions.clone());
        let files = FileService::new(
            db.clone(),
            backends.clone(),
            permissions.clone(),
            settings.allow_normal_user_upload,
        );
        let relocator = Relocator::new(files.clone(), backends.clone());
        let uploads = UploadService::new(
            SessionStore::new(db.clone()),
            QuotaTracker::new(db.clone()),
            backends.clone(),
            files.clone(),
            relocator,
            permissions,
            settings,
            &storage_dir,
        );

        Self {
            db,
            storage_dir,
            uploads,
            files,
            backends,
        }
    }
}
