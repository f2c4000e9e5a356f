use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub upload: UploadSettings,
}

/// Limits and timings for the chunked upload pipeline.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Size of every block except the last one of a session.
    pub block_size: u64,
    /// Largest file a single session may announce.
    pub max_file_size: u64,
    /// Ceiling for the sum of all in-flight session sizes.
    pub max_uploading_size: u64,
    /// Whether users without the upload flag may upload small files.
    pub allow_normal_user_upload: bool,
    pub max_normal_user_upload_size: u64,
    /// Sessions untouched for longer than this are reaped.
    pub session_ttl: Duration,
    pub reaper_interval: Duration,
    pub reaper_initial_delay: Duration,
    /// Delay before a cancelled session's temp directory is removed.
    pub cancel_grace: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            block_size: 4 * MIB,
            max_file_size: 8 * GIB,
            max_uploading_size: 20 * GIB,
            allow_normal_user_upload: true,
            max_normal_user_upload_size: 16 * MIB,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            reaper_interval: Duration::from_secs(60 * 60),
            reaper_initial_delay: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(1),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload and file storage service")]
pub struct Args {
    /// Host to bind to (overrides FILE_DEPOT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_DEPOT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for session blocks and assembled files (overrides FILE_DEPOT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_DEPOT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Block size in bytes (overrides FILE_DEPOT_BLOCK_SIZE)
    #[arg(long)]
    pub block_size: Option<u64>,

    /// Maximum size of one file in bytes (overrides FILE_DEPOT_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Maximum bytes reserved by in-flight uploads (overrides FILE_DEPOT_MAX_UPLOADING_SIZE)
    #[arg(long)]
    pub max_uploading_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name))?;
        Ok((cfg, migrate))
    }

    /// Merge parsed arguments over values produced by `lookup`.
    ///
    /// CLI flags win over environment variables, which win over defaults.
    pub fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let defaults = UploadSettings::default();

        // --- Environment fallback ---
        let env_host = lookup("FILE_DEPOT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "FILE_DEPOT_PORT", 3000u16)?;
        let env_storage =
            lookup("FILE_DEPOT_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = lookup("FILE_DEPOT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/file_depot.db".into());

        let upload = UploadSettings {
            block_size: match args.block_size {
                Some(v) => v,
                None => parse_var(&lookup, "FILE_DEPOT_BLOCK_SIZE", defaults.block_size)?,
            },
            max_file_size: match args.max_file_size {
                Some(v) => v,
                None => parse_var(&lookup, "FILE_DEPOT_MAX_FILE_SIZE", defaults.max_file_size)?,
            },
            max_uploading_size: match args.max_uploading_size {
                Some(v) => v,
                None => parse_var(
                    &lookup,
                    "FILE_DEPOT_MAX_UPLOADING_SIZE",
                    defaults.max_uploading_size,
                )?,
            },
            allow_normal_user_upload: parse_var(
                &lookup,
                "FILE_DEPOT_ALLOW_NORMAL_USER_UPLOAD",
                defaults.allow_normal_user_upload,
            )?,
            max_normal_user_upload_size: parse_var(
                &lookup,
                "FILE_DEPOT_MAX_NORMAL_USER_UPLOAD_SIZE",
                defaults.max_normal_user_upload_size,
            )?,
            session_ttl: parse_secs(&lookup, "FILE_DEPOT_SESSION_TTL_SECS", defaults.session_ttl)?,
            reaper_interval: parse_secs(
                &lookup,
                "FILE_DEPOT_REAPER_INTERVAL_SECS",
                defaults.reaper_interval,
            )?,
            reaper_initial_delay: parse_secs(
                &lookup,
                "FILE_DEPOT_REAPER_INITIAL_DELAY_SECS",
                defaults.reaper_initial_delay,
            )?,
            cancel_grace: defaults.cancel_grace,
        };

        if upload.block_size == 0 {
            anyhow::bail!("block size must be greater than zero");
        }

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            upload,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_secs<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}
