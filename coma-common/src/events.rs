//! Event types for the COMA event system
//!
//! Provides the shared ingest event definitions and the EventBus used to
//! broadcast them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingest event types
///
/// Events are broadcast via EventBus and can be serialized for external
/// transmission. Each pipeline instance is identified by its `record_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// Ingest run started after discovery
    RunStarted {
        /// Run identifier
        run_id: Uuid,
        /// Staging root that was scanned
        staging_root: String,
        /// Number of files discovered
        files_discovered: usize,
        /// When the run started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A pipeline instance entered a new stage
    StageEntered {
        /// Pipeline instance identifier
        record_id: Uuid,
        /// Source file being ingested
        file: String,
        /// Stage name (e.g. "Described", "Calibrated")
        stage: String,
        /// When the stage was entered
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A record was parked in the dead-letter sink
    DeadLettered {
        /// Pipeline instance identifier
        record_id: Uuid,
        /// Source file being ingested
        file: String,
        /// Stage at which the record failed
        stage: String,
        /// Human readable failure reason
        reason: String,
        /// When the record was dead-lettered
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A record was archived and persisted
    Persisted {
        /// Pipeline instance identifier
        record_id: Uuid,
        /// Source file being ingested
        file: String,
        /// Final archive location
        archive_path: String,
        /// Identifier of the stored image record
        image_id: i64,
        /// Number of photometry records submitted
        photometry_records: usize,
        /// When persistence completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A record was left in staging because of a process-level failure
    Deferred {
        /// Pipeline instance identifier
        record_id: Uuid,
        /// Source file being ingested
        file: String,
        /// Human readable failure reason
        reason: String,
        /// When the record was deferred
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Ingest run finished
    RunCompleted {
        /// Run identifier
        run_id: Uuid,
        /// Records persisted and archived
        persisted: usize,
        /// Records dead-lettered
        dead_lettered: usize,
        /// Records deferred to a later run
        deferred: usize,
        /// Wall-clock duration of the run
        duration_seconds: u64,
        /// When the run completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Central event distribution bus
///
/// Uses tokio::broadcast for one-to-many event distribution. Slow subscribers
/// lose the oldest events once `capacity` events are buffered.
///
/// # Examples
///
/// ```
/// use coma_common::events::{EventBus, IngestEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(IngestEvent::RunStarted {
///     run_id: uuid::Uuid::new_v4(),
///     staging_root: "/data/staging/atlas".to_string(),
///     files_discovered: 3,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
