//! Core data models for the upload pipeline.
//!
//! Rows map to tables via `sqlx::FromRow`; the `*View` types are what the
//! HTTP layer serializes.

pub mod bitmap;
pub mod file;
pub mod response;
pub mod storage_record;
pub mod upload_session;
