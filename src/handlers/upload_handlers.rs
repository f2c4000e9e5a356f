//! HTTP handlers for the chunked upload lifecycle.

use crate::{
    errors::AppError,
    handlers::auth::AuthenticatedUser,
    models::response::ApiResponse,
    services::upload_service::CreateUploadRequest,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use bytes::Bytes;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FinishQuery {
    pub md5: Option<String>,
}

/// `POST /api/files/upload/init`
pub async fn init_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<CreateUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.uploads.create_session(user_id, req).await?;
    Ok(Json(ApiResponse::success(session)))
}

/// `POST /api/files/upload/block/{id}/{index}` with the raw block as body.
pub async fn upload_block(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path((id, index)): Path<(i64, usize)>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.upload_block(user_id, id, index, body).await?;
    Ok(Json(ApiResponse::ok(format!("block {} uploaded", index))))
}

/// `POST /api/files/upload/finish/{id}?md5=`
pub async fn finish_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<i64>,
    Query(query): Query<FinishQuery>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.uploads.finalize(user_id, id, query.md5).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// `POST /api/files/upload/cancel/{id}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.cancel(user_id, id).await?;
    Ok(Json(ApiResponse::ok("upload cancelled")))
}
