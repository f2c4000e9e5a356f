pub mod auth;
pub mod file_handlers;
pub mod health_handlers;
pub mod storage_handlers;
pub mod upload_handlers;
