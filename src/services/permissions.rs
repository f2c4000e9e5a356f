//! Permission checks consumed by the upload pipeline.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;

#[async_trait]
pub trait UploadPermissions: Send + Sync + 'static {
    /// Whether `user_id` holds the explicit upload permission.
    async fn can_user_upload(&self, user_id: i64) -> anyhow::Result<bool>;

    async fn is_admin(&self, user_id: i64) -> anyhow::Result<bool>;
}

/// Reads the flags mirrored into the `users` table. Unknown users have
/// neither flag.
#[derive(Clone)]
pub struct DbPermissions {
    db: Arc<SqlitePool>,
}

impl DbPermissions {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn flags(&self, user_id: i64) -> anyhow::Result<Option<(bool, bool)>> {
        let row: Option<(bool, bool)> =
            sqlx::query_as("SELECT is_admin, can_upload FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&*self.db)
                .await?;
        Ok(row)
    }
}

#[async_trait]
impl UploadPermissions for DbPermissions {
    async fn can_user_upload(&self, user_id: i64) -> anyhow::Result<bool> {
        // Admins may always upload.
        Ok(self
            .flags(user_id)
            .await?
            .is_some_and(|(is_admin, can_upload)| is_admin || can_upload))
    }

    async fn is_admin(&self, user_id: i64) -> anyhow::Result<bool> {
        Ok(self.flags(user_id).await?.is_some_and(|(is_admin, _)| is_admin))
    }
}
