//! Ingest pipeline orchestrator
//!
//! # State Progression
//! Discovered → Staged → Described → IdentityResolved → Normalized →
//! ReferencesResolved → Calibrated → Measured → Archived → Persisted
//!
//! Any gated failure moves the record to DeadLettered and skips every later
//! stage. Each stage is handled by a `stage_*` method:
//!
//! - **stage_intake**: scratch copy, header description
//! - **stage_resolution**: identity, flight checks, references
//! - **stage_processing**: calibration, measurement fan-out
//! - **stage_completion**: archive move, persistence
//!
//! One pipeline instance runs per discovered file over a bounded worker
//! pool. Instances share only the reference cache and the dead-letter sink.

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult, StageFailure};
use crate::flight_checks::FlightChecks;
use crate::models::{FileOutcome, ObservationRecord, PipelineState, RecordOutcome, RunSummary};
use crate::services::archive::ArchivalMover;
use crate::services::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::services::file_scanner::FileScanner;
use crate::services::identity::IdentityResolver;
use crate::services::job_client::{JobClient, JobService};
use crate::services::persistence::{PersistenceWriter, RecordWriter};
use crate::services::reference_store::{ReferenceCache, ReferenceError, ReferenceStore};
use crate::services::sci_jobs::ScienceJobs;
use crate::services::staging::Stager;
use crate::utils::retry_with_backoff;
use chrono::Utc;
use coma_common::events::{EventBus, IngestEvent};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod stage_completion;
mod stage_intake;
mod stage_processing;
mod stage_resolution;

/// External collaborators of the pipeline
pub struct PipelineDeps {
    pub jobs: Arc<dyn JobService>,
    pub references: Arc<dyn ReferenceStore>,
    pub writer: Arc<dyn RecordWriter>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

pub struct IngestOrchestrator {
    staging_root: PathBuf,
    concurrency: usize,
    store_max_wait_ms: u64,
    event_bus: EventBus,
    scanner: FileScanner,
    stager: Stager,
    science: ScienceJobs,
    identity: IdentityResolver,
    flight_checks: FlightChecks,
    references: Arc<ReferenceCache>,
    mover: ArchivalMover,
    writer: PersistenceWriter,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl IngestOrchestrator {
    pub fn new(config: &IngestConfig, deps: PipelineDeps, event_bus: EventBus) -> Self {
        let paths = &config.paths;
        let client = JobClient::from_config(deps.jobs, &config.jobs);
        let science = ScienceJobs::new(client, config.photometry.clone(), config.orbit.clone());

        let scanner = FileScanner::new(paths.file_suffix.clone()).excluding([
            &paths.scratch_dir,
            &paths.archive_root,
            &paths.dead_letter_dir,
        ]);

        Self {
            staging_root: paths.staging_root.clone(),
            concurrency: config.pipeline.concurrency.max(1),
            store_max_wait_ms: config.pipeline.store_max_wait_ms,
            event_bus,
            scanner,
            stager: Stager::new(&paths.scratch_dir),
            identity: IdentityResolver::new(
                science.clone(),
                config.pipeline.packed_sources.clone(),
                config.jobs.identity_retries,
            ),
            science,
            flight_checks: FlightChecks::new(config.pipeline.exposure_window_secs),
            references: Arc::new(ReferenceCache::new(deps.references)),
            mover: ArchivalMover::new(&paths.archive_root, config.pipeline.archive_collision),
            writer: PersistenceWriter::new(deps.writer),
            dead_letters: deps.dead_letters,
        }
    }

    /// Shared reference cache (for out-of-band refresh)
    pub fn reference_cache(&self) -> Arc<ReferenceCache> {
        self.references.clone()
    }

    /// Files a run would pick up
    pub fn discover(&self) -> IngestResult<Vec<PathBuf>> {
        Ok(self.scanner.scan(&self.staging_root)?)
    }

    /// Execute one ingest run
    ///
    /// Process-level failures (missing staging root, unreachable reference
    /// store) fail the run before any record is touched. Per-record failures
    /// only ever affect their own record.
    pub async fn run(&self, cancel_token: &CancellationToken) -> IngestResult<RunSummary> {
        let start_time = std::time::Instant::now();
        let run_id = Uuid::new_v4();

        let files = self.discover()?;
        self.wait_for_reference_store().await?;

        tracing::info!(
            run_id = %run_id,
            staging_root = %self.staging_root.display(),
            files = files.len(),
            concurrency = self.concurrency,
            "Starting ingest run"
        );

        self.event_bus.emit_lossy(IngestEvent::RunStarted {
            run_id,
            staging_root: self.staging_root.display().to_string(),
            files_discovered: files.len(),
            timestamp: Utc::now(),
        });

        let mut summary = RunSummary::new(run_id, files.len());

        let outcomes: Vec<RecordOutcome> = stream::iter(files)
            .map(|source| self.process_file(source, cancel_token))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            summary.record(outcome);
        }

        let duration_seconds = start_time.elapsed().as_secs();
        tracing::info!(
            run_id = %run_id,
            discovered = summary.discovered,
            persisted = summary.persisted,
            dead_lettered = summary.dead_lettered,
            deferred = summary.deferred,
            duration_seconds,
            "Ingest run completed"
        );

        self.event_bus.emit_lossy(IngestEvent::RunCompleted {
            run_id,
            persisted: summary.persisted,
            dead_lettered: summary.dead_lettered,
            deferred: summary.deferred,
            duration_seconds,
            timestamp: Utc::now(),
        });

        Ok(summary)
    }

    async fn wait_for_reference_store(&self) -> IngestResult<()> {
        retry_with_backoff(
            "reference store ping",
            self.store_max_wait_ms,
            |e: &ReferenceError| matches!(e, ReferenceError::Unavailable(_)),
            || self.references.ping(),
        )
        .await
        .map_err(|e| IngestError::StoreUnavailable(e.to_string()))
    }

    /// Drive one file to a terminal outcome
    async fn process_file(&self, source: PathBuf, run_cancel: &CancellationToken) -> RecordOutcome {
        let mut record = ObservationRecord::discovered(&source);
        let record_id = record.record_id();
        let record_cancel = run_cancel.child_token();

        tracing::debug!(record_id = %record_id, file = %source.display(), "Pipeline instance started");

        let outcome = if run_cancel.is_cancelled() {
            self.defer(&record, "run cancelled before start".to_string())
        } else {
            match self.drive(&mut record, &record_cancel).await {
                Ok(()) => self.completed(&record),
                Err((stage, failure)) => {
                    // Stop anything still running on behalf of this record
                    record_cancel.cancel();

                    if failure.is_deferral() {
                        self.defer(&record, failure.to_string())
                    } else if run_cancel.is_cancelled() {
                        self.defer(&record, "run cancelled".to_string())
                    } else {
                        self.dead_letter(&mut record, stage, failure).await
                    }
                }
            }
        };

        self.stager.discard(record_id).await;

        RecordOutcome {
            record_id,
            source,
            outcome,
        }
    }

    /// Success path; the first failing stage is returned with its failure
    async fn drive(
        &self,
        record: &mut ObservationRecord,
        cancel: &CancellationToken,
    ) -> Result<(), (PipelineState, StageFailure)> {
        let at = |stage: PipelineState| move |failure: StageFailure| (stage, failure);

        self.stage_staging(record).await.map_err(at(PipelineState::Staged))?;
        self.stage_describe(record, cancel).await.map_err(at(PipelineState::Described))?;
        self.stage_identity(record, cancel)
            .await
            .map_err(at(PipelineState::IdentityResolved))?;
        self.stage_normalize(record).map_err(at(PipelineState::Normalized))?;
        self.stage_references(record)
            .await
            .map_err(at(PipelineState::ReferencesResolved))?;
        self.stage_calibrate(record, cancel).await.map_err(at(PipelineState::Calibrated))?;
        self.stage_measure(record, cancel).await.map_err(at(PipelineState::Measured))?;
        self.stage_archive(record).await.map_err(at(PipelineState::Archived))?;
        self.stage_persist(record).await.map_err(at(PipelineState::Persisted))?;

        Ok(())
    }

    fn enter(&self, record: &ObservationRecord, stage: PipelineState) {
        tracing::debug!(
            record_id = %record.record_id(),
            file = %record.source().display(),
            stage = %stage,
            "Entering stage"
        );
        self.event_bus.emit_lossy(IngestEvent::StageEntered {
            record_id: record.record_id(),
            file: record.source().display().to_string(),
            stage: stage.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn completed(&self, record: &ObservationRecord) -> FileOutcome {
        let archive_path = record.archive_path().map(Path::to_path_buf).unwrap_or_default();
        let receipt = record.receipt().cloned();

        match receipt {
            Some(receipt) => {
                tracing::info!(
                    record_id = %record.record_id(),
                    file = %record.source().display(),
                    archive_path = %archive_path.display(),
                    image_id = receipt.image_id,
                    photometry_records = receipt.photometry_ids.len(),
                    "Record persisted"
                );
                self.event_bus.emit_lossy(IngestEvent::Persisted {
                    record_id: record.record_id(),
                    file: record.source().display().to_string(),
                    archive_path: archive_path.display().to_string(),
                    image_id: receipt.image_id,
                    photometry_records: receipt.photometry_ids.len(),
                    timestamp: Utc::now(),
                });
                FileOutcome::Persisted {
                    archive_path,
                    receipt,
                }
            }
            // drive() only returns Ok after the receipt slot is filled
            None => FileOutcome::Deferred {
                reason: "pipeline finished without a receipt".to_string(),
            },
        }
    }

    fn defer(&self, record: &ObservationRecord, reason: String) -> FileOutcome {
        tracing::warn!(
            record_id = %record.record_id(),
            file = %record.source().display(),
            reason = %reason,
            "Record deferred to next run"
        );
        self.event_bus.emit_lossy(IngestEvent::Deferred {
            record_id: record.record_id(),
            file: record.source().display().to_string(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        FileOutcome::Deferred { reason }
    }

    async fn dead_letter(
        &self,
        record: &mut ObservationRecord,
        stage: PipelineState,
        failure: StageFailure,
    ) -> FileOutcome {
        let reason = failure.to_string();
        tracing::warn!(
            record_id = %record.record_id(),
            file = %record.source().display(),
            stage = %stage,
            category = failure.category(),
            reason = %reason,
            "Record dead-lettered"
        );

        let entry = DeadLetterEntry::new(record.source().to_path_buf(), reason.clone(), stage)
            .with_record(record.record_id());

        if let Err(e) = self.dead_letters.park(&entry).await {
            tracing::error!(
                record_id = %record.record_id(),
                error = %e,
                "Dead-letter sink write failed"
            );
        }
        if let Err(e) = record.dead_lettered(entry) {
            tracing::error!(record_id = %record.record_id(), error = %e, "Dead-letter transition rejected");
        }

        self.event_bus.emit_lossy(IngestEvent::DeadLettered {
            record_id: record.record_id(),
            file: record.source().display().to_string(),
            stage: stage.to_string(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });

        FileOutcome::DeadLettered { stage, reason }
    }
}
