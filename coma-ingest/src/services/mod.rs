//! Service modules for the ingest pipeline
//!
//! Leaf collaborators first; the orchestrator drives them per record.

pub mod archive;
pub mod dead_letter;
pub mod file_scanner;
pub mod identity;
pub mod ingest_orchestrator;
pub mod job_client;
pub mod persistence;
pub mod reference_store;
pub mod sci_jobs;
pub mod staging;

pub use archive::{archive_destination, ArchivalMover, ArchiveError, ArchivedFile, CollisionPolicy};
pub use dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterSink, MemoryDeadLetterSink, SqliteDeadLetterSink};
pub use file_scanner::{FileScanner, ScanError};
pub use identity::{IdentityResolver, IdentitySource};
pub use ingest_orchestrator::{IngestOrchestrator, PipelineDeps};
pub use job_client::{BackoffPolicy, HttpJobService, JobClient, JobError, JobKind, JobService, JobStatus};
pub use persistence::{
    HttpRecordWriter, ImageRecord, PersistError, PersistReceipt, PersistenceWriter, RecordWriter,
};
pub use reference_store::{
    resolve_references, CatalogueRef, ReferenceCache, ReferenceError, ReferenceKind, ReferenceStore,
    ResolvedReferences, SqliteReferenceStore,
};
pub use sci_jobs::{CalibrationResult, Measurements, ScienceJobs};
pub use staging::Stager;
