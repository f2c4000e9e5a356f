//! HTTP handlers for persisted files.
//! Local objects are streamed back; everything else is a redirect.

use crate::{
    errors::AppError,
    handlers::auth::AuthenticatedUser,
    models::response::ApiResponse,
    services::file_service::{CreateRedirectRequest, UpdateFileRequest},
    state::AppState,
    storage::DownloadTarget,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
}

/// `POST /api/files/redirect`
pub async fn create_redirect(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<CreateRedirectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.files.create_redirect(user_id, req).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// `GET /api/files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.files.get(&id).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// `PUT /api/files/{id}`
pub async fn update_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateFileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.files.update(user_id, &id, req).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// `DELETE /api/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.files.delete(user_id, &id).await?;
    Ok(Json(ApiResponse::ok("file deleted")))
}

/// `GET /api/files/download/{id}`
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let download = state.files.download(&id).await?;
    match download.target {
        DownloadTarget::Url(url) => {
            let location = HeaderValue::from_str(&url).map_err(|err| {
                tracing::error!(%err, "download url is not a valid header value");
                AppError::internal("internal server error")
            })?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        DownloadTarget::LocalPath(path) => {
            let file = File::open(&path).await.map_err(|err| {
                tracing::error!(path = %path.display(), %err, "failed to open stored file");
                AppError::internal("internal server error")
            })?;
            let len = file.metadata().await.ok().map(|m| m.len());

            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            *response.status_mut() = StatusCode::OK;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            if let Ok(value) = HeaderValue::from_str(&content_disposition(&download.filename)) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            if let Some(len) = len {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            Ok(response)
        }
    }
}

/// `GET /api/files/user/{user_id}?page=`
pub async fn list_user_files(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .files
        .list_user_files(user_id, query.page.unwrap_or(1))
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// `attachment` disposition with an ASCII fallback name.
fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("attachment; filename=\"{}\"", ascii)
}
