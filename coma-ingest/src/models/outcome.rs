//! Per-file and per-run ingest outcomes

use super::PipelineState;
use crate::services::persistence::PersistReceipt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Terminal result of one pipeline instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Archived and persisted
    Persisted {
        archive_path: PathBuf,
        receipt: PersistReceipt,
    },
    /// Parked in the dead-letter sink
    DeadLettered {
        stage: PipelineState,
        reason: String,
    },
    /// Left in staging after a process-level failure, retried next run
    Deferred { reason: String },
}

/// Outcome for one discovered file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub record_id: Uuid,
    pub source: PathBuf,
    pub outcome: FileOutcome,
}

/// Run-level summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub discovered: usize,
    pub persisted: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub outcomes: Vec<RecordOutcome>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, discovered: usize) -> Self {
        Self {
            run_id,
            discovered,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome.outcome {
            FileOutcome::Persisted { .. } => self.persisted += 1,
            FileOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            FileOutcome::Deferred { .. } => self.deferred += 1,
        }
        self.outcomes.push(outcome);
    }

    /// Outcome for a given staged source file
    pub fn outcome_for(&self, source: &std::path::Path) -> Option<&FileOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.source == source)
            .map(|o| &o.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary::new(Uuid::new_v4(), 3);
        summary.record(RecordOutcome {
            record_id: Uuid::new_v4(),
            source: PathBuf::from("/staging/a.fz"),
            outcome: FileOutcome::DeadLettered {
                stage: PipelineState::Normalized,
                reason: "exposure duration is zero".to_string(),
            },
        });
        summary.record(RecordOutcome {
            record_id: Uuid::new_v4(),
            source: PathBuf::from("/staging/b.fz"),
            outcome: FileOutcome::Deferred {
                reason: "store offline".to_string(),
            },
        });

        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.persisted, 0);
        assert!(matches!(
            summary.outcome_for(std::path::Path::new("/staging/a.fz")),
            Some(FileOutcome::DeadLettered { .. })
        ));
    }
}
