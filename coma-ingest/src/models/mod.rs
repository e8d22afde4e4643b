//! Data models for coma-ingest
//!
//! - Observation header description
//! - Append-only observation record and its pipeline state machine
//! - Per-file and per-run outcomes

pub mod header;
pub mod outcome;
pub mod pipeline_state;
pub mod record;

pub use header::Description;
pub use outcome::{FileOutcome, RecordOutcome, RunSummary};
pub use pipeline_state::{IllegalTransition, PipelineState, StateTransition};
pub use record::{ObservationRecord, RecordError, WriteOnce};
