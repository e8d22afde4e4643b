//! Error types for coma-ingest
//!
//! Two levels:
//! - [`StageFailure`]: fatal to one record; routes it to the dead-letter
//!   sink (or defers it when the reference store is unreachable)
//! - [`IngestError`]: fatal to the run

use crate::designation::DecodeError;
use crate::flight_checks::FlightCheckFailure;
use crate::models::RecordError;
use crate::services::archive::ArchiveError;
use crate::services::job_client::JobError;
use crate::services::persistence::PersistError;
use crate::services::reference_store::{ReferenceError, ReferenceKind};
use std::path::PathBuf;
use thiserror::Error;

/// Per-record failure
#[derive(Debug, Error)]
pub enum StageFailure {
    /// Flight-check verdict Fail, or identity inputs missing
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Reference not found: {0}")]
    ReferenceNotFound(ReferenceKind),

    /// Timeout, failed job or malformed result
    #[error("External service failure: {0}")]
    ExternalService(#[from] JobError),

    #[error("Designation decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Archive destination already exists: {}", .0.display())]
    ArchiveConflict(PathBuf),

    #[error("Archive move failed: {0}")]
    Archive(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistError),

    #[error("Staging copy failed: {0}")]
    Staging(String),

    /// Process-level condition surfacing inside a record; the record is
    /// deferred rather than dead-lettered
    #[error("Reference store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record bookkeeping error: {0}")]
    Record(#[from] RecordError),
}

impl StageFailure {
    pub fn flight_checks(failures: &[FlightCheckFailure]) -> Self {
        let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
        StageFailure::Validation(format!("flight checks failed: {}", reasons.join(", ")))
    }

    /// Short machine-friendly category for logs and the dead-letter ledger
    pub fn category(&self) -> &'static str {
        match self {
            StageFailure::Validation(_) => "validation",
            StageFailure::ReferenceNotFound(_) => "reference_not_found",
            StageFailure::ExternalService(_) => "external_service",
            StageFailure::Decode(_) => "decode",
            StageFailure::ArchiveConflict(_) => "archive_conflict",
            StageFailure::Archive(_) => "archive",
            StageFailure::Persistence(_) => "persistence",
            StageFailure::Staging(_) => "staging",
            StageFailure::StoreUnavailable(_) => "store_unavailable",
            StageFailure::Record(_) => "record",
        }
    }

    /// Whether the record should be left in staging for the next run
    pub fn is_deferral(&self) -> bool {
        matches!(self, StageFailure::StoreUnavailable(_))
    }
}

impl From<ReferenceError> for StageFailure {
    fn from(err: ReferenceError) -> Self {
        match err {
            ReferenceError::NotFound(kind) => StageFailure::ReferenceNotFound(kind),
            ReferenceError::Unavailable(detail) => StageFailure::StoreUnavailable(detail),
        }
    }
}

impl From<ArchiveError> for StageFailure {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Conflict(path) => StageFailure::ArchiveConflict(path),
            other => StageFailure::Archive(other.to_string()),
        }
    }
}

/// Run-level error
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Staging scan failed: {0}")]
    Scan(#[from] crate::services::file_scanner::ScanError),

    #[error("Reference store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] coma_common::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
