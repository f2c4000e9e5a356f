#![allow(dead_code)]

use async_trait::async_trait;
use file_depot::{
    config::UploadSettings,
    db,
    models::{storage_record::StorageRecord, upload_session::UploadSessionView},
    services::{
        backend_service::CreateStorageRequest,
        permissions::{DbPermissions, UploadPermissions},
        upload_service::CreateUploadRequest,
    },
    state::AppState,
    storage::{
        BackendKind, DownloadTarget, StorageBackend, StorageError, StorageResult,
        registry::{StorageRegistry, open_record},
    },
};
use serde_json::json;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Notify;

type Overrides = Arc<Mutex<HashMap<i64, Arc<dyn StorageBackend>>>>;

pub const UPLOADER: i64 = 1;
pub const NORMAL_USER: i64 = 2;
pub const ADMIN: i64 = 3;

pub struct TestApp {
    pub state: AppState,
    pub db: Arc<SqlitePool>,
    pub storage_id: i64,
    pub objects_dir: PathBuf,
    pub dir: TempDir,
    overrides: Overrides,
}

pub fn test_settings() -> UploadSettings {
    UploadSettings {
        block_size: 2,
        max_file_size: 1024,
        max_uploading_size: 4096,
        allow_normal_user_upload: true,
        max_normal_user_upload_size: 8,
        session_ttl: Duration::from_secs(3600),
        reaper_interval: Duration::from_secs(3600),
        reaper_initial_delay: Duration::from_secs(0),
        cancel_grace: Duration::from_millis(0),
    }
}

pub async fn setup() -> TestApp {
    setup_with(test_settings()).await
}

pub async fn setup_with(settings: UploadSettings) -> TestApp {
    setup_custom(settings, |db| {
        Arc::new(DbPermissions::new(db)) as Arc<dyn UploadPermissions>
    })
    .await
}

/// Build the app with a caller-supplied permission source.
pub async fn setup_custom<F>(settings: UploadSettings, permissions: F) -> TestApp
where
    F: FnOnce(Arc<SqlitePool>) -> Arc<dyn UploadPermissions>,
{
    let dir = TempDir::new().expect("create temp dir");
    let url = format!("sqlite://{}", dir.path().join("depot.db").display());
    let pool = db::connect(&url, 8).await.expect("connect sqlite");
    db::migrate(&pool).await.expect("run migrations");
    let db = Arc::new(pool);

    for (id, name, is_admin, can_upload) in [
        (UPLOADER, "uploader", false, true),
        (NORMAL_USER, "normal", false, false),
        (ADMIN, "admin", true, false),
    ] {
        sqlx::query("INSERT INTO users (id, username, is_admin, can_upload) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(is_admin)
            .bind(can_upload)
            .execute(&*db)
            .await
            .expect("seed user");
    }

    let staging = dir.path().join("staging");
    let objects_dir = dir.path().join("objects");
    let overrides: Overrides = Arc::default();
    let lookup = overrides.clone();
    let registry = StorageRegistry::with_opener(
        db.clone(),
        Arc::new(move |record: &StorageRecord| {
            let replaced = lookup.lock().unwrap().get(&record.id).cloned();
            match replaced {
                Some(backend) => Ok(backend),
                None => open_record(record),
            }
        }),
    );
    let state = AppState::with_registry(
        db.clone(),
        staging,
        settings,
        permissions(db.clone()),
        registry,
    );

    let storage = state
        .backends
        .create(
            ADMIN,
            CreateStorageRequest {
                name: "local".into(),
                kind: BackendKind::Local,
                config: json!({ "path": objects_dir.to_string_lossy() }),
                max_size_in_mb: 0,
            },
        )
        .await
        .expect("register local storage");
    state
        .backends
        .set_default(ADMIN, storage.id)
        .await
        .expect("set default storage");

    TestApp {
        state,
        db,
        storage_id: storage.id,
        objects_dir,
        dir,
        overrides,
    }
}

pub fn upload_request(size: u64) -> CreateUploadRequest {
    CreateUploadRequest {
        filename: "data.bin".into(),
        description: "test upload".into(),
        file_size: size,
        resource_id: 7,
        storage_id: None,
        md5: None,
    }
}

impl TestApp {
    pub async fn init(&self, user_id: i64, size: u64) -> UploadSessionView {
        self.state
            .uploads
            .create_session(user_id, upload_request(size))
            .await
            .expect("create session")
    }

    /// Upload `data` split into blocks of the configured size, in order.
    pub async fn upload_all(&self, user_id: i64, session_id: i64, data: &[u8]) {
        let block = self.state.uploads.settings().block_size as usize;
        for (index, chunk) in data.chunks(block).enumerate() {
            self.state
                .uploads
                .upload_block(user_id, session_id, index, chunk.to_vec().into())
                .await
                .expect("upload block");
        }
    }

    pub async fn temp_dir_of(&self, session_id: i64) -> PathBuf {
        PathBuf::from(
            self.state
                .uploads
                .sessions()
                .get(session_id)
                .await
                .expect("session exists")
                .temp_dir,
        )
    }

    pub async fn file_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&*self.db)
            .await
            .expect("count files")
    }

    pub async fn storage_usage(&self, storage_id: i64) -> i64 {
        sqlx::query_scalar("SELECT current_size FROM storages WHERE id = ?")
            .bind(storage_id)
            .fetch_one(&*self.db)
            .await
            .expect("read usage")
    }

    pub async fn backdate_session(&self, session_id: i64, secs: i64) {
        sqlx::query("UPDATE upload_sessions SET updated_at = updated_at - ? WHERE id = ?")
            .bind(secs)
            .bind(session_id)
            .execute(&*self.db)
            .await
            .expect("backdate session");
    }

    /// Serve `backend` for storage `id` instead of what its row describes.
    pub fn use_backend(&self, id: i64, backend: Arc<dyn StorageBackend>) {
        self.overrides.lock().unwrap().insert(id, backend);
        self.state.backends.registry().evict(id);
    }

    pub fn assembled_dir(&self) -> PathBuf {
        self.dir.path().join("staging").join("assembled")
    }
}

pub async fn read_target(target: &DownloadTarget) -> Vec<u8> {
    match target {
        DownloadTarget::LocalPath(path) => tokio::fs::read(path).await.expect("read object"),
        DownloadTarget::Url(url) => panic!("expected a local path, got {}", url),
    }
}

pub async fn dir_entries(path: &Path) -> usize {
    let mut count = 0;
    if let Ok(mut entries) = tokio::fs::read_dir(path).await {
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
    }
    count
}

/// Backend whose uploads always fail after leaving nothing behind.
pub struct FailingBackend;

#[async_trait]
impl StorageBackend for FailingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn upload(&self, _local_path: &Path, _desired_name: &str) -> StorageResult<String> {
        Err(StorageError::Rejected("quota exceeded upstream".into()))
    }

    async fn download(&self, _key: &str, _filename: &str) -> StorageResult<DownloadTarget> {
        Err(StorageError::FileUnavailable)
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    fn serialize(&self) -> String {
        "{}".into()
    }
}

/// In-memory backend that records every call.
#[derive(Default)]
pub struct MemoryBackend {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn upload(&self, local_path: &Path, desired_name: &str) -> StorageResult<String> {
        let bytes = tokio::fs::read(local_path).await?;
        let key = format!("{}/{}", uuid::Uuid::new_v4(), desired_name);
        self.objects.lock().unwrap().insert(key.clone(), bytes);
        Ok(key)
    }

    async fn download(&self, key: &str, _filename: &str) -> StorageResult<DownloadTarget> {
        if self.objects.lock().unwrap().contains_key(key) {
            Ok(DownloadTarget::Url(format!("https://cdn.test/{}", key)))
        } else {
            Err(StorageError::FileUnavailable)
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.lock().unwrap().remove(key);
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn serialize(&self) -> String {
        "{}".into()
    }
}

/// In-memory backend whose uploads block until `release` is notified.
#[derive(Default)]
pub struct GatedBackend {
    pub release: Arc<Notify>,
    pub inner: MemoryBackend,
}

#[async_trait]
impl StorageBackend for GatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn upload(&self, local_path: &Path, desired_name: &str) -> StorageResult<String> {
        self.release.notified().await;
        self.inner.upload(local_path, desired_name).await
    }

    async fn download(&self, key: &str, filename: &str) -> StorageResult<DownloadTarget> {
        self.inner.download(key, filename).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn serialize(&self) -> String {
        "{}".into()
    }
}
