//! Background transfer of assembled files to their storage backend.
//!
//! A finalized file already has a row with an empty storage key. The task
//! either fills the key in, or removes the row together with whatever it put
//! on the backend. The assembled local file is removed in both cases.

use crate::{
    models::file::PersistedFile,
    services::{
        ServiceError, ServiceResult, backend_service::BackendService, file_service::FileService,
    },
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Relocator {
    files: FileService,
    backends: BackendService,
    tracker: TaskTracker,
}

impl Relocator {
    pub fn new(files: FileService, backends: BackendService) -> Self {
        Self {
            files,
            backends,
            tracker: TaskTracker::new(),
        }
    }

    /// Start relocating `file` from `assembled` without waiting for it.
    pub fn spawn(&self, file: PersistedFile, assembled: PathBuf) {
        let this = self.clone();
        self.tracker.spawn(async move {
            this.run(file, assembled).await;
        });
    }

    /// Wait until every relocation started so far has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn run(&self, file: PersistedFile, assembled: PathBuf) {
        match self.relocate(&file, &assembled).await {
            Ok(key) => {
                info!(file_id = %file.public_id, storage_key = %key, "file relocated");
            }
            Err(err) => {
                error!(file_id = %file.public_id, %err, "relocation failed, removing file record");
                if let Err(err) = self.files.delete_row(file.id).await {
                    error!(file_id = %file.public_id, %err, "failed to remove file record");
                }
            }
        }

        if let Err(err) = fs::remove_file(&assembled).await {
            warn!(path = %assembled.display(), %err, "failed to remove assembled file");
        }
    }

    async fn relocate(&self, file: &PersistedFile, assembled: &Path) -> ServiceResult<String> {
        let storage_id = file
            .storage_id
            .ok_or_else(|| ServiceError::Internal(format!("file {} has no storage", file.id)))?;

        self.backends.add_usage(storage_id, file.size).await?;

        let pushed = async {
            let backend = self.backends.registry().get(storage_id).await?;
            let key = backend.upload(assembled, &file.filename).await?;
            Ok::<_, ServiceError>((backend, key))
        }
        .await;

        let (backend, key) = match pushed {
            Ok(pushed) => pushed,
            Err(err) => {
                self.revert_usage(storage_id, file.size).await;
                return Err(err);
            }
        };

        let recorded = match self.files.set_storage_key(file.id, &key).await {
            Ok(true) => return Ok(key),
            Ok(false) => ServiceError::not_found("file record removed during relocation"),
            Err(err) => err,
        };

        if let Err(err) = backend.delete(&key).await {
            error!(storage_id, storage_key = %key, %err, "failed to remove orphaned object");
        }
        self.revert_usage(storage_id, file.size).await;
        Err(recorded)
    }

    async fn revert_usage(&self, storage_id: i64, size: i64) {
        if let Err(err) = self.backends.add_usage(storage_id, -size).await {
            error!(storage_id, %err, "failed to revert storage usage");
        }
    }
}
