//! In-progress chunked upload, as stored in `upload_sessions`.

use crate::models::bitmap::{BitmapLengthMismatch, BlockBitmap};
use serde::Serialize;
use sqlx::FromRow;
use std::path::PathBuf;

#[derive(Debug, Clone, FromRow)]
pub struct UploadSession {
    pub id: i64,
    pub filename: String,
    pub description: String,
    pub total_size: i64,
    /// Fixed for the lifetime of the session.
    pub block_size: i64,
    /// Packed completion bitmap, see [`BlockBitmap`].
    pub blocks: Vec<u8>,
    /// Directory holding `<index>` block files for this session only.
    pub temp_dir: String,
    pub user_id: i64,
    pub resource_id: i64,
    pub storage_id: i64,
    /// MD5 the client expects the assembled file to have, if it sent one.
    pub content_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadSession {
    pub fn blocks_count(&self) -> usize {
        blocks_for(self.total_size as u64, self.block_size as u64)
    }

    pub fn bitmap(&self) -> Result<BlockBitmap, BitmapLengthMismatch> {
        BlockBitmap::from_bytes(self.blocks_count(), self.blocks.clone())
    }

    pub fn is_last_block(&self, index: usize) -> bool {
        index + 1 == self.blocks_count()
    }

    pub fn block_path(&self, index: usize) -> PathBuf {
        PathBuf::from(&self.temp_dir).join(index.to_string())
    }

    pub fn view(&self) -> UploadSessionView {
        UploadSessionView {
            id: self.id,
            filename: self.filename.clone(),
            description: self.description.clone(),
            total_size: self.total_size,
            block_size: self.block_size,
            blocks_count: self.blocks_count(),
            storage_id: self.storage_id,
            resource_id: self.resource_id,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Number of blocks needed to carry `total` bytes.
pub fn blocks_for(total: u64, block_size: u64) -> usize {
    total.div_ceil(block_size) as usize
}

/// What the client sees after init: enough to schedule block uploads.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionView {
    pub id: i64,
    pub filename: String,
    pub description: String,
    pub total_size: i64,
    pub block_size: i64,
    pub blocks_count: usize,
    pub storage_id: i64,
    pub resource_id: i64,
    pub content_hash: Option<String>,
}
