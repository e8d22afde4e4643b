//! Append-only observation record
//!
//! One record per discovered file. Each stage fills exactly one write-once
//! slot and advances the state in the same call, so a slot can never be
//! overwritten and a stage can never run out of order.

use super::pipeline_state::{IllegalTransition, PipelineState, StateTransition};
use super::Description;
use crate::designation::CanonicalDesignation;
use crate::flight_checks::ValidatedObservation;
use crate::services::archive::ArchivedFile;
use crate::services::dead_letter::DeadLetterEntry;
use crate::services::persistence::PersistReceipt;
use crate::services::reference_store::ResolvedReferences;
use crate::services::sci_jobs::{CalibrationResult, Measurements};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Record bookkeeping errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("Record field {0} is already set")]
    AlreadySet(&'static str),

    #[error("Record field {0} has not been set")]
    Missing(&'static str),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Slot that accepts a single write
#[derive(Debug, Clone)]
pub struct WriteOnce<T> {
    field: &'static str,
    value: Option<T>,
}

impl<T> WriteOnce<T> {
    pub fn new(field: &'static str) -> Self {
        Self { field, value: None }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn require(&self) -> Result<&T, RecordError> {
        self.value.as_ref().ok_or(RecordError::Missing(self.field))
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn set(&mut self, value: T) -> Result<(), RecordError> {
        if self.value.is_some() {
            return Err(RecordError::AlreadySet(self.field));
        }
        self.value = Some(value);
        Ok(())
    }
}

/// Observation record built up by the pipeline stages
#[derive(Debug, Clone)]
pub struct ObservationRecord {
    record_id: Uuid,
    source: PathBuf,
    discovered_at: DateTime<Utc>,
    state: PipelineState,
    transitions: Vec<StateTransition>,
    scratch: WriteOnce<PathBuf>,
    description: WriteOnce<Description>,
    identity: WriteOnce<CanonicalDesignation>,
    observation: WriteOnce<ValidatedObservation>,
    references: WriteOnce<ResolvedReferences>,
    calibration: WriteOnce<CalibrationResult>,
    measurements: WriteOnce<Measurements>,
    archived: WriteOnce<ArchivedFile>,
    receipt: WriteOnce<PersistReceipt>,
    dead_letter: WriteOnce<DeadLetterEntry>,
}

impl ObservationRecord {
    /// Create a record for a file found in staging
    pub fn discovered(source: impl Into<PathBuf>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            source: source.into(),
            discovered_at: Utc::now(),
            state: PipelineState::Discovered,
            transitions: Vec::new(),
            scratch: WriteOnce::new("scratch"),
            description: WriteOnce::new("description"),
            identity: WriteOnce::new("identity"),
            observation: WriteOnce::new("observation"),
            references: WriteOnce::new("references"),
            calibration: WriteOnce::new("calibration"),
            measurements: WriteOnce::new("measurements"),
            archived: WriteOnce::new("archived"),
            receipt: WriteOnce::new("receipt"),
            dead_letter: WriteOnce::new("dead_letter"),
        }
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    /// Staged source file
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn scratch(&self) -> Option<&Path> {
        self.scratch.get().map(PathBuf::as_path)
    }

    pub fn description(&self) -> Result<&Description, RecordError> {
        self.description.require()
    }

    pub fn identity(&self) -> Result<&CanonicalDesignation, RecordError> {
        self.identity.require()
    }

    pub fn observation(&self) -> Result<&ValidatedObservation, RecordError> {
        self.observation.require()
    }

    pub fn references(&self) -> Result<&ResolvedReferences, RecordError> {
        self.references.require()
    }

    pub fn calibration(&self) -> Result<&CalibrationResult, RecordError> {
        self.calibration.require()
    }

    pub fn measurements(&self) -> Result<&Measurements, RecordError> {
        self.measurements.require()
    }

    pub fn archive_path(&self) -> Option<&Path> {
        self.archived.get().map(|archived| archived.path.as_path())
    }

    pub fn archived_file(&self) -> Result<&ArchivedFile, RecordError> {
        self.archived.require()
    }

    pub fn receipt(&self) -> Option<&PersistReceipt> {
        self.receipt.get()
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterEntry> {
        self.dead_letter.get()
    }

    pub fn staged(&mut self, scratch: PathBuf) -> Result<(), RecordError> {
        self.check(PipelineState::Staged)?;
        self.scratch.set(scratch)?;
        self.commit(PipelineState::Staged);
        Ok(())
    }

    pub fn described(&mut self, description: Description) -> Result<(), RecordError> {
        self.check(PipelineState::Described)?;
        self.description.set(description)?;
        self.commit(PipelineState::Described);
        Ok(())
    }

    pub fn identity_resolved(&mut self, identity: CanonicalDesignation) -> Result<(), RecordError> {
        self.check(PipelineState::IdentityResolved)?;
        self.identity.set(identity)?;
        self.commit(PipelineState::IdentityResolved);
        Ok(())
    }

    pub fn normalized(&mut self, observation: ValidatedObservation) -> Result<(), RecordError> {
        self.check(PipelineState::Normalized)?;
        self.observation.set(observation)?;
        self.commit(PipelineState::Normalized);
        Ok(())
    }

    pub fn references_resolved(&mut self, references: ResolvedReferences) -> Result<(), RecordError> {
        self.check(PipelineState::ReferencesResolved)?;
        self.references.set(references)?;
        self.commit(PipelineState::ReferencesResolved);
        Ok(())
    }

    pub fn calibrated(&mut self, calibration: CalibrationResult) -> Result<(), RecordError> {
        self.check(PipelineState::Calibrated)?;
        self.calibration.set(calibration)?;
        self.commit(PipelineState::Calibrated);
        Ok(())
    }

    pub fn measured(&mut self, measurements: Measurements) -> Result<(), RecordError> {
        self.check(PipelineState::Measured)?;
        self.measurements.set(measurements)?;
        self.commit(PipelineState::Measured);
        Ok(())
    }

    pub fn archived(&mut self, archived: ArchivedFile) -> Result<(), RecordError> {
        self.check(PipelineState::Archived)?;
        self.archived.set(archived)?;
        self.commit(PipelineState::Archived);
        Ok(())
    }

    pub fn persisted(&mut self, receipt: PersistReceipt) -> Result<(), RecordError> {
        self.check(PipelineState::Persisted)?;
        self.receipt.set(receipt)?;
        self.commit(PipelineState::Persisted);
        Ok(())
    }

    pub fn dead_lettered(&mut self, entry: DeadLetterEntry) -> Result<(), RecordError> {
        self.check(PipelineState::DeadLettered)?;
        self.dead_letter.set(entry)?;
        self.commit(PipelineState::DeadLettered);
        Ok(())
    }

    fn check(&self, next: PipelineState) -> Result<(), IllegalTransition> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(IllegalTransition {
                from: self.state,
                to: next,
            })
        }
    }

    fn commit(&mut self, next: PipelineState) {
        self.transitions.push(StateTransition {
            record_id: self.record_id,
            old_state: self.state,
            new_state: next,
            transitioned_at: Utc::now(),
        });
        self.state = next;
    }
}
