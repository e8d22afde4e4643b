//! Staged and Described
//!
//! The working copy is made before anything else touches the file; the
//! describe job reads the staged source so the header reflects exactly what
//! was discovered.

use super::IngestOrchestrator;
use crate::error::StageFailure;
use crate::models::{ObservationRecord, PipelineState};
use tokio_util::sync::CancellationToken;

impl IngestOrchestrator {
    pub(super) async fn stage_staging(&self, record: &mut ObservationRecord) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Staged);

        let working_copy = self
            .stager
            .stage(record.record_id(), record.source())
            .await
            .map_err(|e| StageFailure::Staging(e.to_string()))?;

        record.staged(working_copy)?;
        Ok(())
    }

    pub(super) async fn stage_describe(
        &self,
        record: &mut ObservationRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Described);

        let description = self.science.describe(record.source(), cancel).await?;
        tracing::debug!(
            record_id = %record.record_id(),
            instrument = ?description.instrument,
            mjd_mid = ?description.mjd_mid,
            "Header described"
        );

        record.described(description)?;
        Ok(())
    }
}
