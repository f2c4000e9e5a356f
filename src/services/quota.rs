//! Bytes reserved by in-flight upload sessions.
//!
//! The counter lives in `statistics` so reservations survive a restart along
//! with the sessions holding them. Admission is a single conditional update,
//! so concurrent reservations can never push the total past the ceiling.

use crate::services::ServiceResult;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

pub const UPLOADING_SIZE_KEY: &str = "uploading_size";

#[derive(Clone)]
pub struct QuotaTracker {
    db: Arc<SqlitePool>,
}

impl QuotaTracker {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Reserve `bytes` if the new total stays within `ceiling`.
    /// Returns whether the reservation was admitted.
    pub async fn reserve(&self, bytes: u64, ceiling: u64) -> ServiceResult<bool> {
        let bytes = to_i64(bytes);
        let result = sqlx::query(
            "UPDATE statistics SET value = value + ? \
             WHERE key = ? AND value + ? <= ?",
        )
        .bind(bytes)
        .bind(UPLOADING_SIZE_KEY)
        .bind(bytes)
        .bind(to_i64(ceiling))
        .execute(&*self.db)
        .await?;

        let admitted = result.rows_affected() == 1;
        debug!(bytes, admitted, "quota reservation");
        Ok(admitted)
    }

    /// Give back a reservation. The counter never drops below zero.
    pub async fn release(&self, bytes: u64) -> ServiceResult<()> {
        sqlx::query("UPDATE statistics SET value = MAX(value - ?, 0) WHERE key = ?")
            .bind(to_i64(bytes))
            .bind(UPLOADING_SIZE_KEY)
            .execute(&*self.db)
            .await?;
        debug!(bytes, "quota released");
        Ok(())
    }

    pub async fn current(&self) -> ServiceResult<u64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM statistics WHERE key = ?")
                .bind(UPLOADING_SIZE_KEY)
                .fetch_optional(&*self.db)
                .await?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
