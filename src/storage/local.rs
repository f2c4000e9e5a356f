//! Local-disk backend: each object is one file named by its key directly
//! under the configured root.

use crate::storage::{
    BackendKind, DownloadTarget, StorageBackend, StorageError, StorageResult, parse_config,
    require_fields,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};
use tokio::fs::{self, File};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(raw: &str) -> StorageResult<Self> {
        let config: LocalConfig = parse_config(BackendKind::Local, raw)?;
        require_fields(BackendKind::Local, &[("path", &config.path)])?;
        Ok(Self::new(config.path))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Keys are generated by this backend and must stay a single path
    /// component so a stored key can never point outside the root.
    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => Ok(self.root.join(part)),
            _ => Err(StorageError::FileUnavailable),
        }
    }

    async fn copy_into_place(&self, local_path: &Path, key: &str) -> StorageResult<()> {
        let tmp_path = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            fs::copy(local_path, &tmp_path).await?;
            File::open(&tmp_path).await?.sync_all().await?;
            fs::rename(&tmp_path, self.root.join(key)).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn upload(&self, local_path: &Path, _desired_name: &str) -> StorageResult<String> {
        self.ensure_root().await?;
        let key = Uuid::new_v4().to_string();
        self.copy_into_place(local_path, &key).await?;
        debug!(root = %self.root.display(), %key, "stored object on local disk");
        Ok(key)
    }

    async fn download(&self, key: &str, _filename: &str) -> StorageResult<DownloadTarget> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(DownloadTarget::LocalPath(path)),
            Ok(_) => Err(StorageError::FileUnavailable),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::FileUnavailable),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = match self.object_path(key) {
            Ok(path) => path,
            // Nothing this backend could have written lives there.
            Err(_) => return Ok(()),
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn serialize(&self) -> String {
        let config = LocalConfig {
            path: self.root.to_string_lossy().into_owned(),
        };
        serde_json::to_string(&config).unwrap_or_default()
    }
}
