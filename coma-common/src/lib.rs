//! # COMA Common Library
//!
//! Shared code for the COMA ingest services including:
//! - Error types
//! - Configuration loading (TOML, environment, compiled defaults)
//! - Ingest event types and the broadcast EventBus

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
