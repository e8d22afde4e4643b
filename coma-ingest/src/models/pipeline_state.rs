//! Per-file pipeline state machine
//!
//! Discovered → Staged → Described → IdentityResolved → Normalized →
//! ReferencesResolved → Calibrated → Measured → Archived → Persisted
//!
//! Every non-terminal state may also move to DeadLettered. Persisted and
//! DeadLettered are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline state of one observation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// File found in the staging tree
    Discovered,
    /// Working copy made in scratch
    Staged,
    /// Header description received
    Described,
    /// Canonical catalogue designation known
    IdentityResolved,
    /// Flight checks passed
    Normalized,
    /// Object, instrument, telescope and filter ids resolved
    ReferencesResolved,
    /// Calibration metrics received
    Calibrated,
    /// Photometry, orbit, ephemeris and coordinates received
    Measured,
    /// Working copy moved to its archive destination
    Archived,
    /// Image, calibration and photometry records stored
    Persisted,
    /// Parked in the dead-letter sink
    DeadLettered,
}

impl PipelineState {
    /// The next state on the success path
    pub fn successor(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Discovered => Some(Staged),
            Staged => Some(Described),
            Described => Some(IdentityResolved),
            IdentityResolved => Some(Normalized),
            Normalized => Some(ReferencesResolved),
            ReferencesResolved => Some(Calibrated),
            Calibrated => Some(Measured),
            Measured => Some(Archived),
            Archived => Some(Persisted),
            Persisted | DeadLettered => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Persisted | PipelineState::DeadLettered)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == PipelineState::DeadLettered || self.successor() == Some(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Discovered => "Discovered",
            PipelineState::Staged => "Staged",
            PipelineState::Described => "Described",
            PipelineState::IdentityResolved => "IdentityResolved",
            PipelineState::Normalized => "Normalized",
            PipelineState::ReferencesResolved => "ReferencesResolved",
            PipelineState::Calibrated => "Calibrated",
            PipelineState::Measured => "Measured",
            PipelineState::Archived => "Archived",
            PipelineState::Persisted => "Persisted",
            PipelineState::DeadLettered => "DeadLettered",
        }
    }

    /// Inverse of [`as_str`](Self::as_str)
    pub fn parse(name: &str) -> Option<PipelineState> {
        use PipelineState::*;
        [
            Discovered,
            Staged,
            Described,
            IdentityResolved,
            Normalized,
            ReferencesResolved,
            Calibrated,
            Measured,
            Archived,
            Persisted,
            DeadLettered,
        ]
        .into_iter()
        .find(|state| state.as_str() == name)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal pipeline transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub record_id: Uuid,
    pub old_state: PipelineState,
    pub new_state: PipelineState,
    pub transitioned_at: DateTime<Utc>,
}
