//! Calibrated and Measured
//!
//! Both stages work on the scratch copy. Measurement fans out to
//! photometry, ephemeris and the orbit → coordinates chain; the first
//! failure cancels the rest.

use super::IngestOrchestrator;
use crate::error::StageFailure;
use crate::models::{ObservationRecord, PipelineState, RecordError};
use tokio_util::sync::CancellationToken;

impl IngestOrchestrator {
    pub(super) async fn stage_calibrate(
        &self,
        record: &mut ObservationRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Calibrated);

        let scratch = record.scratch().ok_or(RecordError::Missing("scratch"))?;
        let calibration = self.science.calibrate(scratch, cancel).await?;

        tracing::debug!(
            record_id = %record.record_id(),
            metrics = calibration.parameters.len(),
            "Calibration received"
        );

        record.calibrated(calibration)?;
        Ok(())
    }

    pub(super) async fn stage_measure(
        &self,
        record: &mut ObservationRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Measured);

        let scratch = record.scratch().ok_or(RecordError::Missing("scratch"))?;
        let observation = record.observation()?;
        let measurements = self
            .science
            .measure(
                scratch,
                record.identity()?,
                &observation.timing,
                observation.normalized.station_code(),
                cancel,
            )
            .await?;

        tracing::debug!(
            record_id = %record.record_id(),
            apertures = measurements.photometry.len(),
            coordinate_samples = measurements.coordinates.len(),
            "Measurements received"
        );

        record.measured(measurements)?;
        Ok(())
    }
}
