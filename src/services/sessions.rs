//! Durable upload session records.
//!
//! Every read-modify-write of a session row runs inside a transaction whose
//! first statement writes that row. SQLite hands out its write lock on that
//! first write, so the bitmap read that follows can't race another writer.

use crate::{
    models::{bitmap::BlockBitmap, upload_session::UploadSession},
    services::{ServiceError, ServiceResult, now_ts},
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::{path::Path, sync::Arc};
use tokio::fs;

const SESSION_COLUMNS: &str = "id, filename, description, total_size, block_size, blocks, \
     temp_dir, user_id, resource_id, storage_id, content_hash, created_at, updated_at";

/// Values for a session about to be created.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub filename: String,
    pub description: String,
    pub total_size: u64,
    pub block_size: u64,
    pub temp_dir: String,
    pub user_id: i64,
    pub resource_id: i64,
    pub storage_id: i64,
    pub content_hash: Option<String>,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: &NewSession) -> ServiceResult<UploadSession> {
        let blocks = BlockBitmap::new(crate::models::upload_session::blocks_for(
            new.total_size,
            new.block_size,
        ));
        let now = now_ts();
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "INSERT INTO upload_sessions (filename, description, total_size, block_size, \
             blocks, temp_dir, user_id, resource_id, storage_id, content_hash, created_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(&new.filename)
        .bind(&new.description)
        .bind(new.total_size as i64)
        .bind(new.block_size as i64)
        .bind(blocks.into_bytes())
        .bind(&new.temp_dir)
        .bind(new.user_id)
        .bind(new.resource_id)
        .bind(new.storage_id)
        .bind(&new.content_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;
        Ok(session)
    }

    pub async fn get(&self, id: i64) -> ServiceResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(session_not_found)
    }

    /// Open a transaction holding the write lock on session `id`.
    /// Touches `updated_at` as a side effect.
    async fn lock(&self, id: i64) -> ServiceResult<(Transaction<'static, Sqlite>, UploadSession)> {
        let mut tx = self.db.begin().await?;
        let touched = sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(session_not_found());
        }
        let session = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        Ok((tx, session))
    }

    /// Mark block `index` as written, moving `staged` into its final place.
    ///
    /// Runs under the session lock. If the bit is already set the staged file
    /// is left for the caller to discard and the stored block is untouched.
    pub async fn commit_block(&self, id: i64, index: usize, staged: &Path) -> ServiceResult<()> {
        let (mut tx, session) = self.lock(id).await?;
        let mut bitmap = session
            .bitmap()
            .map_err(|e| ServiceError::Internal(format!("session {}: {}", id, e)))?;
        if !bitmap.set(index) {
            return Err(ServiceError::request(format!(
                "block {} has already been uploaded",
                index
            )));
        }

        fs::rename(staged, session.block_path(index)).await?;

        sqlx::query("UPDATE upload_sessions SET blocks = ? WHERE id = ?")
            .bind(bitmap.into_bytes())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomically check and consume a complete session owned by `user_id`.
    ///
    /// Incomplete sessions are left exactly as they were. Once this returns
    /// the row is gone, so a concurrent caller gets `NotFound`.
    pub async fn claim_complete(&self, id: i64, user_id: i64) -> ServiceResult<UploadSession> {
        let (mut tx, session) = self.lock(id).await?;
        ensure_owner(&session, user_id)?;

        let bitmap = session
            .bitmap()
            .map_err(|e| ServiceError::Internal(format!("session {}: {}", id, e)))?;
        if let Some(missing) = bitmap.first_missing() {
            return Err(ServiceError::request(format!(
                "file is not completely uploaded: block {} of {} is missing ({} received)",
                missing,
                bitmap.len(),
                bitmap.count_set()
            )));
        }

        delete_in(&mut tx, id).await?;
        tx.commit().await?;
        Ok(session)
    }

    /// Remove a session owned by `user_id` regardless of its progress.
    pub async fn take_owned(&self, id: i64, user_id: i64) -> ServiceResult<UploadSession> {
        let (mut tx, session) = self.lock(id).await?;
        ensure_owner(&session, user_id)?;
        delete_in(&mut tx, id).await?;
        tx.commit().await?;
        Ok(session)
    }

    /// Delete session `id`; false when it was already gone.
    pub async fn delete(&self, id: i64) -> ServiceResult<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sessions last modified before `cutoff` (unix seconds).
    pub async fn list_stale(&self, cutoff: i64) -> ServiceResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE updated_at < ? ORDER BY id",
            SESSION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }
}

async fn delete_in(tx: &mut Transaction<'static, Sqlite>, id: i64) -> ServiceResult<()> {
    sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) fn ensure_owner(session: &UploadSession, user_id: i64) -> ServiceResult<()> {
    if session.user_id != user_id {
        return Err(ServiceError::unauthorized(
            "upload session belongs to another user",
        ));
    }
    Ok(())
}

fn session_not_found() -> ServiceError {
    ServiceError::not_found("upload session not found")
}
