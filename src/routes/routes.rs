//! Defines routes for the upload pipeline, files and storage backends.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST /api/files/upload/init` - open a session
//!   - `POST /api/files/upload/block/{id}/{index}` - raw block body
//!   - `POST /api/files/upload/finish/{id}` - assemble (optional `?md5=`)
//!   - `POST /api/files/upload/cancel/{id}` - drop the session
//!
//! - **Files**
//!   - `POST /api/files/redirect` - register an external URL
//!   - `GET|PUT|DELETE /api/files/{id}` - by public id
//!   - `GET /api/files/download/{id}` - stream or redirect
//!   - `GET /api/files/user/{user_id}` - paged listing
//!
//! - **Storage backends**
//!   - `GET|POST /api/storage`, `DELETE /api/storage/{id}`,
//!     `PUT /api/storage/{id}/default`

use crate::{
    handlers::{
        file_handlers::{
            create_redirect, delete_file, download_file, get_file, list_user_files, update_file,
        },
        health_handlers::{healthz, readyz},
        storage_handlers::{create_storage, delete_storage, list_storages, set_default_storage},
        upload_handlers::{cancel_upload, finish_upload, init_upload, upload_block},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Slack over the block size so an oversized block gets a descriptive
/// rejection instead of a bare 413.
const BLOCK_BODY_SLACK: usize = 1024;

/// Build the router. `block_size` bounds the body of block uploads.
pub fn routes(block_size: u64) -> Router<AppState> {
    let block_limit = usize::try_from(block_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BLOCK_BODY_SLACK);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload sessions
        .route("/api/files/upload/init", post(init_upload))
        .route(
            "/api/files/upload/block/{id}/{index}",
            post(upload_block).layer(DefaultBodyLimit::max(block_limit)),
        )
        .route("/api/files/upload/finish/{id}", post(finish_upload))
        .route("/api/files/upload/cancel/{id}", post(cancel_upload))
        // files
        .route("/api/files/redirect", post(create_redirect))
        .route("/api/files/download/{id}", get(download_file))
        .route("/api/files/user/{user_id}", get(list_user_files))
        .route(
            "/api/files/{id}",
            get(get_file).put(update_file).delete(delete_file),
        )
        // storage backends
        .route("/api/storage", get(list_storages).post(create_storage))
        .route("/api/storage/{id}", axum::routing::delete(delete_storage))
        .route("/api/storage/{id}/default", put(set_default_storage))
}
