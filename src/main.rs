use anyhow::Result;
use axum::Router;
use file_depot::{
    config::AppConfig, db, routes, services::permissions::DbPermissions,
    services::reaper::Reaper, state::AppState,
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::{fs, net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-depot with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir).await?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Apply migrations; exit afterwards in migration mode ---
    db::migrate(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize services ---
    let permissions = Arc::new(DbPermissions::new(db.clone()));
    let state = AppState::new(
        db.clone(),
        cfg.storage_dir.clone(),
        cfg.upload.clone(),
        permissions,
    );

    // --- Background sweep of abandoned sessions ---
    tokio::spawn(Reaper::new(state.uploads.clone()).run());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.upload.block_size).with_state(state.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Let in-flight relocations finish ---
    tracing::info!("Waiting for background transfers to finish");
    state.uploads.wait_idle().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
