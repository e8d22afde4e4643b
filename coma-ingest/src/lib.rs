//! coma-ingest library interface
//!
//! Exposes the pipeline, its collaborators and their traits for the binary
//! and for integration testing.

pub mod config;
pub mod db;
pub mod designation;
pub mod error;
pub mod flight_checks;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::IngestConfig;
pub use crate::error::{IngestError, IngestResult, StageFailure};
pub use crate::services::{IngestOrchestrator, PipelineDeps};
