//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> SQLite round trip, staging-disk write/read, quota counter

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap liveness probe; never touches I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. The body lists each check.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", check_sqlite(&state).await);
    checks.insert("disk", check_disk(&state).await);
    checks.insert("quota", check_quota(&state).await);

    let overall_ok = checks.values().all(|c| c.ok);
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

async fn check_sqlite(state: &AppState) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(None),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

/// Blocks and assembled files are staged under `storage_dir`, so it must be
/// writable.
async fn check_disk(state: &AppState) -> CheckStatus {
    let tmp_path = state
        .storage_dir
        .join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {}", e));
    }
    let result = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(None),
        Ok(_) => CheckStatus::failed("file content mismatch".into()),
        Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
    };
    match fs::remove_file(&tmp_path).await {
        Err(e) if result.ok => CheckStatus::ok(Some(format!("could not remove tmp file: {}", e))),
        _ => result,
    }
}

async fn check_quota(state: &AppState) -> CheckStatus {
    match state.uploads.quota().current().await {
        Ok(_) => CheckStatus::ok(None),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok(note: Option<String>) -> Self {
        Self { ok: true, error: note }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
