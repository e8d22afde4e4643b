//! Archived and Persisted
//!
//! The archive move consumes the scratch copy. If persistence then fails
//! the archive move is rolled back: the archived file is removed and any
//! file it overwrote is put back, so a dead-lettered record never changes
//! the archive. The staged source is only removed once every record has
//! been stored.

use super::IngestOrchestrator;
use crate::error::StageFailure;
use crate::models::{ObservationRecord, PipelineState, RecordError};
use crate::services::persistence::ImageRecord;

impl IngestOrchestrator {
    pub(super) async fn stage_archive(&self, record: &mut ObservationRecord) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Archived);

        let scratch = record.scratch().ok_or(RecordError::Missing("scratch"))?;
        let observation = record.observation()?;
        let references = record.references()?;

        let archived = self
            .mover
            .archive(
                scratch,
                &references.object.archive_key(),
                &observation.timing.archive_date_string(),
                observation.normalized.instrument(),
            )
            .await?;

        record.archived(archived)?;
        Ok(())
    }

    pub(super) async fn stage_persist(&self, record: &mut ObservationRecord) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Persisted);

        let archived = record.archived_file()?.clone();

        let persisted: Result<_, StageFailure> = async {
            let image = ImageRecord::from_record(record, &archived.path)?;
            let receipt = self
                .writer
                .persist(&image, record.calibration()?, record.measurements()?)
                .await?;
            Ok(receipt)
        }
        .await;

        let receipt = match persisted {
            Ok(receipt) => receipt,
            Err(failure) => {
                if let Err(e) = self.mover.roll_back(&archived).await {
                    tracing::error!(
                        record_id = %record.record_id(),
                        archive_path = %archived.path.display(),
                        error = %e,
                        "Failed to roll back archived file"
                    );
                }
                return Err(failure);
            }
        };

        record.persisted(receipt)?;

        if let Err(e) = self.mover.commit(&archived).await {
            tracing::warn!(
                record_id = %record.record_id(),
                displaced = ?archived.displaced,
                error = %e,
                "Displaced archive file could not be removed"
            );
        }

        if let Err(e) = tokio::fs::remove_file(record.source()).await {
            tracing::warn!(
                record_id = %record.record_id(),
                file = %record.source().display(),
                error = %e,
                "Persisted record's staged source could not be removed"
            );
        }

        Ok(())
    }
}
