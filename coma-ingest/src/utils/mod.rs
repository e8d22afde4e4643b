//! Utility modules for coma-ingest

pub mod retry;

pub use retry::{retry_on_lock, retry_with_backoff};
