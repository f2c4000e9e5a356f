//! HTTP handlers for storage backend administration.

use crate::{
    errors::AppError, handlers::auth::AuthenticatedUser, models::response::ApiResponse,
    services::backend_service::CreateStorageRequest, state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

/// `POST /api/storage`
pub async fn create_storage(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<CreateStorageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let storage = state.backends.create(user_id, req).await?;
    Ok(Json(ApiResponse::success(storage)))
}

/// `GET /api/storage`
pub async fn list_storages(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let storages = state.backends.list().await?;
    Ok(Json(ApiResponse::success(storages)))
}

/// `DELETE /api/storage/{id}`
pub async fn delete_storage(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state.backends.delete(user_id, id).await?;
    Ok(Json(ApiResponse::ok("storage deleted")))
}

/// `PUT /api/storage/{id}/default`
pub async fn set_default_storage(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state.backends.set_default(user_id, id).await?;
    Ok(Json(ApiResponse::ok("default storage updated")))
}
