//! IdentityResolved, Normalized and ReferencesResolved
//!
//! The three gates. A failure in any of them ends the record.

use super::IngestOrchestrator;
use crate::error::StageFailure;
use crate::flight_checks::FlightChecks;
use crate::models::{ObservationRecord, PipelineState};
use crate::services::reference_store::resolve_references;
use tokio_util::sync::CancellationToken;

impl IngestOrchestrator {
    pub(super) async fn stage_identity(
        &self,
        record: &mut ObservationRecord,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::IdentityResolved);

        let identity = self
            .identity
            .resolve_identity(record.source(), record.description()?, cancel)
            .await?;

        tracing::debug!(record_id = %record.record_id(), designation = %identity, "Identity resolved");
        record.identity_resolved(identity)?;
        Ok(())
    }

    pub(super) fn stage_normalize(&self, record: &mut ObservationRecord) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::Normalized);

        let (normalized, verdict) = self.flight_checks.normalize(record.description()?);
        let defaulted = normalized.defaulted_fields();
        if !defaulted.is_empty() {
            tracing::info!(
                record_id = %record.record_id(),
                defaulted = ?defaulted,
                "Missing header values defaulted"
            );
        }

        let validated =
            FlightChecks::gate(normalized, verdict).map_err(|failures| StageFailure::flight_checks(&failures))?;

        record.normalized(validated)?;
        Ok(())
    }

    pub(super) async fn stage_references(&self, record: &mut ObservationRecord) -> Result<(), StageFailure> {
        self.enter(record, PipelineState::ReferencesResolved);

        let observation = &record.observation()?.normalized;
        let resolved = resolve_references(
            self.references.as_ref(),
            record.identity()?,
            observation.instrument(),
            observation.filter(),
        )
        .await?;

        tracing::debug!(
            record_id = %record.record_id(),
            object_id = resolved.object.object_id,
            instrument_id = resolved.instrument_id,
            telescope_id = resolved.telescope_id,
            filter_id = resolved.filter_id,
            "References resolved"
        );

        record.references_resolved(resolved)?;
        Ok(())
    }
}
