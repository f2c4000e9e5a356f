//! FTP backend. The client is blocking, so every session runs on the
//! blocking pool and opens its own connection.

use crate::storage::{
    BackendKind, DownloadTarget, NETWORK_TIMEOUT, StorageBackend, StorageError, StorageResult,
    parse_config, public_url, require_fields, sanitize_filename,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
};
use suppaftp::{FtpError, FtpStream, Status, types::FileType};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 21;

fn default_base_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    /// `host` or `host:port`.
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Domain serving `base_path` over HTTP(S).
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct FtpBackend {
    config: FtpConfig,
}

impl FtpBackend {
    pub fn from_config(raw: &str) -> StorageResult<Self> {
        let mut config: FtpConfig = parse_config(BackendKind::Ftp, raw)?;
        require_fields(
            BackendKind::Ftp,
            &[
                ("host", &config.host),
                ("username", &config.username),
                ("password", &config.password),
                ("domain", &config.domain),
            ],
        )?;
        if config.base_path.trim().is_empty() {
            config.base_path = default_base_path();
        }
        Ok(Self { config })
    }

    fn remote_path(&self, key: &str) -> String {
        format!("{}/{}", self.config.base_path.trim_end_matches('/'), key)
    }

    /// Run `op` against a fresh, logged-in connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> StorageResult<T> + Send + 'static,
    {
        let config = self.config.clone();
        task::spawn_blocking(move || {
            let mut ftp = connect(&config)?;
            let result = op(&mut ftp);
            if let Err(err) = ftp.quit() {
                debug!(error = %err, "ftp quit failed");
            }
            result
        })
        .await
        .map_err(|err| StorageError::Io(io::Error::other(err)))?
    }
}

/// `host` with the default port added unless it already names one. Bare
/// IPv6 literals are bracketed.
fn with_port(host: &str) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => format!("{}:{}", host, DEFAULT_PORT),
    }
}

fn resolve(host: &str) -> StorageResult<SocketAddr> {
    let target = with_port(host);
    target
        .to_socket_addrs()
        .map_err(|e| StorageError::Unreachable(format!("resolving {}: {}", target, e)))?
        .next()
        .ok_or_else(|| StorageError::Unreachable(format!("no address for {}", target)))
}

fn connect(config: &FtpConfig) -> StorageResult<FtpStream> {
    let addr = resolve(&config.host)?;
    let mut ftp = FtpStream::connect_timeout(addr, NETWORK_TIMEOUT).map_err(classify_error)?;
    ftp.get_ref().set_read_timeout(Some(NETWORK_TIMEOUT))?;
    ftp.get_ref().set_write_timeout(Some(NETWORK_TIMEOUT))?;
    ftp.login(&config.username, &config.password)
        .map_err(|err| StorageError::Rejected(format!("ftp login: {}", err)))?;
    ftp.transfer_type(FileType::Binary).map_err(classify_error)?;
    Ok(ftp)
}

/// Create every directory on the way to `dir`. Existing ones make `mkdir`
/// fail, which is ignored; a real problem surfaces at `STOR`.
fn mkdir_all(ftp: &mut FtpStream, dir: &Path) {
    let mut current = PathBuf::new();
    for part in dir.components() {
        current.push(part);
        let path = current.to_string_lossy();
        if path == "/" {
            continue;
        }
        let _ = ftp.mkdir(&*path);
    }
}

fn is_missing(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

fn classify_error(err: FtpError) -> StorageError {
    match err {
        FtpError::ConnectionError(io_err) => StorageError::Unreachable(io_err.to_string()),
        FtpError::UnexpectedResponse(resp) => {
            StorageError::Rejected(format!("ftp server answered {:?}", resp.status))
        }
        other => StorageError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for FtpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ftp
    }

    async fn upload(&self, local_path: &Path, desired_name: &str) -> StorageResult<String> {
        let key = format!("{}/{}", Uuid::new_v4(), sanitize_filename(desired_name));
        let remote = self.remote_path(&key);
        let local = local_path.to_path_buf();

        let stored = self
            .with_connection({
                let remote = remote.clone();
                move |ftp| {
                    if let Some(parent) = Path::new(&remote).parent() {
                        mkdir_all(ftp, parent);
                    }
                    let mut file = File::open(&local)?;
                    match ftp.put_file(&remote, &mut file) {
                        Ok(_) => Ok(()),
                        Err(err) => {
                            let _ = ftp.rm(&remote);
                            Err(classify_error(err))
                        }
                    }
                }
            })
            .await;

        if let Err(err) = stored {
            // The connection may have dropped before the inline cleanup ran.
            if let Err(cleanup) = self.delete(&key).await {
                warn!(%key, error = %cleanup, "failed to remove partial ftp object");
            }
            return Err(err);
        }

        debug!(host = %self.config.host, %key, "stored object on ftp");
        Ok(key)
    }

    async fn download(&self, key: &str, _filename: &str) -> StorageResult<DownloadTarget> {
        let remote = self.remote_path(key);
        self.with_connection(move |ftp| match ftp.size(&remote) {
            Ok(_) => Ok(()),
            Err(err) if is_missing(&err) => Err(StorageError::FileUnavailable),
            Err(err) => Err(classify_error(err)),
        })
        .await?;
        Ok(DownloadTarget::Url(public_url(&self.config.domain, key)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let remote = self.remote_path(key);
        self.with_connection(move |ftp| match ftp.rm(&remote) {
            Ok(()) => Ok(()),
            Err(err) if is_missing(&err) => Ok(()),
            Err(err) => Err(classify_error(err)),
        })
        .await
    }

    fn serialize(&self) -> String {
        serde_json::to_string(&self.config).unwrap_or_default()
    }
}
