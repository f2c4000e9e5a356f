//! Chunked upload lifecycle: init, block writes, finalize and cancel.
//!
//! Blocks land in `<storage_dir>/uploading/<uuid>/<index>`; finalize
//! concatenates them into `<storage_dir>/assembled/<uuid>` and hands that
//! file to the [`Relocator`].

use crate::{
    config::UploadSettings,
    models::{
        file::FileView,
        upload_session::{UploadSession, UploadSessionView},
    },
    services::{
        ServiceError, ServiceResult,
        backend_service::BackendService,
        file_service::{FileService, NewFile},
        permissions::UploadPermissions,
        quota::QuotaTracker,
        relocation::Relocator,
        sessions::{NewSession, SessionStore, ensure_owner},
        validate_filename,
    },
};
use bytes::Bytes;
use md5::Context;
use serde::Deserialize;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    pub filename: String,
    #[serde(default)]
    pub description: String,
    pub file_size: u64,
    pub resource_id: i64,
    /// Destination backend; the default backend when absent.
    pub storage_id: Option<i64>,
    /// Expected MD5 of the whole file, hex encoded.
    pub md5: Option<String>,
}

#[derive(Clone)]
pub struct UploadService {
    sessions: SessionStore,
    quota: QuotaTracker,
    backends: BackendService,
    files: FileService,
    relocator: Relocator,
    permissions: Arc<dyn UploadPermissions>,
    settings: UploadSettings,
    uploading_dir: PathBuf,
    assembled_dir: PathBuf,
    cleanups: TaskTracker,
}

impl UploadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionStore,
        quota: QuotaTracker,
        backends: BackendService,
        files: FileService,
        relocator: Relocator,
        permissions: Arc<dyn UploadPermissions>,
        settings: UploadSettings,
        storage_dir: impl AsRef<Path>,
    ) -> Self {
        let storage_dir = storage_dir.as_ref();
        Self {
            sessions,
            quota,
            backends,
            files,
            relocator,
            permissions,
            settings,
            uploading_dir: storage_dir.join("uploading"),
            assembled_dir: storage_dir.join("assembled"),
            cleanups: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Wait for pending relocations and deferred temp-dir removals.
    pub async fn wait_idle(&self) {
        self.relocator.wait_idle().await;
        self.cleanups.close();
        self.cleanups.wait().await;
        self.cleanups.reopen();
    }

    /// Open a new upload session after permission, size and quota checks.
    pub async fn create_session(
        &self,
        user_id: i64,
        req: CreateUploadRequest,
    ) -> ServiceResult<UploadSessionView> {
        let filename = validate_filename(&req.filename)?;
        let size = req.file_size;
        if size == 0 {
            return Err(ServiceError::request("file size must be greater than zero"));
        }

        let can_upload = self.permissions.can_user_upload(user_id).await?;
        if !can_upload
            && (!self.settings.allow_normal_user_upload
                || size > self.settings.max_normal_user_upload_size)
        {
            return Err(ServiceError::unauthorized(
                "user does not have permission to upload this file",
            ));
        }
        if size > self.settings.max_file_size {
            return Err(ServiceError::request(format!(
                "file size exceeds the limit of {} bytes",
                self.settings.max_file_size
            )));
        }

        let content_hash = req.md5.as_deref().map(normalize_md5).transpose()?;

        let storage_id = match req.storage_id {
            Some(id) => id,
            None => self
                .backends
                .default_id()
                .await?
                .ok_or_else(|| ServiceError::request("no storage selected and no default set"))?,
        };
        let storage = self.backends.registry().record(storage_id).await?;
        if storage.remaining().is_some_and(|left| left < size as i64) {
            return Err(ServiceError::request(format!(
                "storage {} does not have enough free space",
                storage_id
            )));
        }

        if !self
            .quota
            .reserve(size, self.settings.max_uploading_size)
            .await?
        {
            return Err(ServiceError::request(
                "server is busy, please try again later",
            ));
        }

        let temp_dir = self.uploading_dir.join(Uuid::new_v4().to_string());
        let created: ServiceResult<UploadSession> = async {
            fs::create_dir_all(&temp_dir).await?;
            self.sessions
                .insert(&NewSession {
                    filename,
                    description: req.description,
                    total_size: size,
                    block_size: self.settings.block_size,
                    temp_dir: temp_dir.to_string_lossy().into_owned(),
                    user_id,
                    resource_id: req.resource_id,
                    storage_id,
                    content_hash,
                })
                .await
        }
        .await;

        match created {
            Ok(session) => {
                info!(
                    session_id = session.id,
                    user_id,
                    size,
                    blocks = session.blocks_count(),
                    "upload session created"
                );
                Ok(session.view())
            }
            Err(err) => {
                self.release_quota(size).await;
                remove_dir(&temp_dir).await;
                Err(err)
            }
        }
    }

    /// Store block `index` of session `id`.
    ///
    /// The payload is written to a staging file first; only the bitmap
    /// update runs under the session lock.
    pub async fn upload_block(
        &self,
        user_id: i64,
        id: i64,
        index: usize,
        data: Bytes,
    ) -> ServiceResult<()> {
        let session = self.sessions.get(id).await?;
        ensure_owner(&session, user_id)?;
        check_block(&session, index, data.len())?;

        let already = session
            .bitmap()
            .map_err(|e| ServiceError::Internal(format!("session {}: {}", id, e)))?
            .get(index);
        if already {
            return Err(ServiceError::request(format!(
                "block {} has already been uploaded",
                index
            )));
        }

        let staged =
            PathBuf::from(&session.temp_dir).join(format!("{}.{}.part", index, Uuid::new_v4()));
        if let Err(err) = write_durably(&staged, &data).await {
            let _ = fs::remove_file(&staged).await;
            if err.kind() == ErrorKind::NotFound {
                // Temp dir vanished: the session was cancelled or reaped.
                return Err(ServiceError::not_found("upload session not found"));
            }
            return Err(err.into());
        }

        if let Err(err) = self.sessions.commit_block(id, index, &staged).await {
            let _ = fs::remove_file(&staged).await;
            return Err(err);
        }

        debug!(session_id = id, index, len = data.len(), "block stored");
        Ok(())
    }

    /// Assemble a complete session into a file record and start relocation.
    ///
    /// `md5` overrides the hash given at init. The session is consumed once
    /// the completeness check passes, even if a later step fails.
    pub async fn finalize(
        &self,
        user_id: i64,
        id: i64,
        md5: Option<String>,
    ) -> ServiceResult<FileView> {
        let expected = md5.as_deref().map(normalize_md5).transpose()?;
        let session = self.sessions.claim_complete(id, user_id).await?;
        self.release_quota(session.total_size as u64).await;

        let assembled = self.assembled_dir.join(Uuid::new_v4().to_string());
        let assembly = assemble(&session, &assembled).await;
        remove_dir(Path::new(&session.temp_dir)).await;

        let (size, digest) = match assembly {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&assembled).await;
                error!(session_id = id, %err, "failed to assemble upload");
                return Err(err.into());
            }
        };

        // A final block of the wrong length only shows up here.
        if size != session.total_size as u64 {
            let _ = fs::remove_file(&assembled).await;
            return Err(ServiceError::request(format!(
                "uploaded {} bytes but the session announced {}",
                size, session.total_size
            )));
        }

        if let Some(expected) = expected.or_else(|| session.content_hash.clone()) {
            if expected != digest {
                let _ = fs::remove_file(&assembled).await;
                return Err(ServiceError::request(format!(
                    "md5 checksum mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }

        let file = match self
            .files
            .insert(&NewFile {
                filename: session.filename.clone(),
                description: session.description.clone(),
                size: session.total_size,
                content_hash: digest,
                user_id: session.user_id,
                resource_id: session.resource_id,
                storage_id: Some(session.storage_id),
                redirect_url: None,
            })
            .await
        {
            Ok(file) => file,
            Err(err) => {
                let _ = fs::remove_file(&assembled).await;
                return Err(err);
            }
        };

        info!(session_id = id, file_id = %file.public_id, size, "upload finalized");
        let view = file.view();
        self.relocator.spawn(file, assembled);
        Ok(view)
    }

    /// Drop session `id`. The temp directory goes after a grace period so a
    /// block write already past its checks can't recreate files in it.
    pub async fn cancel(&self, user_id: i64, id: i64) -> ServiceResult<()> {
        let session = self.sessions.take_owned(id, user_id).await?;
        self.release_quota(session.total_size as u64).await;

        let grace = self.settings.cancel_grace;
        let temp_dir = PathBuf::from(&session.temp_dir);
        self.cleanups.spawn(async move {
            tokio::time::sleep(grace).await;
            remove_dir(&temp_dir).await;
        });

        info!(session_id = id, user_id, "upload session cancelled");
        Ok(())
    }

    /// Discard an abandoned session without an owner check.
    /// Returns false when the session was already gone.
    pub async fn expire(&self, session: &UploadSession) -> ServiceResult<bool> {
        if !self.sessions.delete(session.id).await? {
            return Ok(false);
        }
        self.quota.release(session.total_size as u64).await?;
        match fs::remove_dir_all(&session.temp_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(true)
    }

    async fn release_quota(&self, bytes: u64) {
        if let Err(err) = self.quota.release(bytes).await {
            error!(bytes, %err, "failed to release upload quota");
        }
    }
}

fn check_block(session: &UploadSession, index: usize, len: usize) -> ServiceResult<()> {
    let count = session.blocks_count();
    if index >= count {
        return Err(ServiceError::request(format!(
            "block index {} is out of range, session has {} blocks",
            index, count
        )));
    }

    let block = session.block_size as u64;
    let len = len as u64;
    if !session.is_last_block(index) {
        if len != block {
            return Err(ServiceError::request(format!(
                "block {} must be exactly {} bytes, got {}",
                index, block, len
            )));
        }
    } else if len == 0 || len > block {
        return Err(ServiceError::request(format!(
            "final block {} must be between 1 and {} bytes, got {}",
            index, block, len
        )));
    }
    Ok(())
}

/// Lowercase hex MD5, or a request error.
fn normalize_md5(raw: &str) -> ServiceResult<String> {
    let hash = raw.trim().to_ascii_lowercase();
    if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ServiceError::request("md5 must be 32 hexadecimal characters"));
    }
    Ok(hash)
}

async fn write_durably(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Concatenate blocks `0..n` into `dest`, returning its size and MD5.
async fn assemble(session: &UploadSession, dest: &Path) -> std::io::Result<(u64, String)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(dest).await?;
    let mut digest = Context::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];

    for index in 0..session.blocks_count() {
        let mut block = File::open(session.block_path(index)).await?;
        loop {
            let n = block.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((size, format!("{:x}", digest.compute())))
}

async fn remove_dir(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove upload directory"),
    }
}
