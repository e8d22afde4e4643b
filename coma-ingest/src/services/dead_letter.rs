//! Dead-letter sink
//!
//! Terminal parking for records that cannot complete the pipeline. Sinks
//! are shared by every pipeline instance and must accept concurrent
//! appends.

use crate::db::dead_letters::insert_dead_letter;
use crate::models::PipelineState;
use crate::services::archive::move_to_free_name;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const LEDGER_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Terminal failure record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub record_id: Option<Uuid>,
    /// Staged source file
    pub source: PathBuf,
    pub reason: String,
    /// Stage that failed
    pub stage: PipelineState,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(source: PathBuf, reason: String, stage: PipelineState) -> Self {
        Self {
            record_id: None,
            source,
            reason,
            stage,
            created_at: Utc::now(),
        }
    }

    pub fn with_record(mut self, record_id: Uuid) -> Self {
        self.record_id = Some(record_id);
        self
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Dead-letter ledger write failed: {0}")]
    Ledger(#[from] coma_common::Error),

    #[error("Failed to quarantine {}: {source}", path.display())]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Park one entry
    async fn park(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError>;
}

/// SQLite ledger plus a quarantine directory for the staged source
pub struct SqliteDeadLetterSink {
    pool: SqlitePool,
    quarantine_dir: PathBuf,
}

impl SqliteDeadLetterSink {
    pub fn new(pool: SqlitePool, quarantine_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            quarantine_dir: quarantine_dir.into(),
        }
    }

    /// Move the staged source out of the staging tree so the next run does
    /// not pick it up again
    async fn quarantine(&self, source: &Path) -> Result<Option<PathBuf>, DeadLetterError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Ok(None);
        }
        let Some(file_name) = source.file_name() else {
            return Ok(None);
        };

        let quarantine_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DeadLetterError::Quarantine { path, source }
        };

        tokio::fs::create_dir_all(&self.quarantine_dir)
            .await
            .map_err(quarantine_err(&self.quarantine_dir))?;

        let target = move_to_free_name(source, &self.quarantine_dir.join(file_name))
            .await
            .map_err(quarantine_err(source))?;

        Ok(Some(target))
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn park(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let row_id = retry_on_lock("dead-letter insert", LEDGER_MAX_LOCK_WAIT_MS, || {
            insert_dead_letter(&self.pool, entry)
        })
        .await?;

        let quarantined = self.quarantine(&entry.source).await?;

        tracing::debug!(
            row_id,
            file = %entry.source.display(),
            quarantined = ?quarantined,
            "Dead-letter entry recorded"
        );
        Ok(())
    }
}

/// In-memory sink
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn park(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dead_letters::list_dead_letters;
    use crate::db::init_database_pool;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_sink_records_and_quarantines() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database_pool(&temp_dir.path().join("coma.db")).await.unwrap();
        let staging = temp_dir.path().join("staging");
        let quarantine = temp_dir.path().join("dead");
        std::fs::create_dir_all(&staging).unwrap();

        let source = staging.join("a.fz");
        std::fs::write(&source, b"fits").unwrap();
        std::fs::write(quarantine_seed(&quarantine), b"older").unwrap();

        let sink = SqliteDeadLetterSink::new(pool.clone(), &quarantine);
        let entry = DeadLetterEntry::new(source.clone(), "filter missing".to_string(), PipelineState::Normalized);
        sink.park(&entry).await.unwrap();

        assert!(!source.exists());
        assert!(quarantine.join("a.fz.1").exists());
        assert_eq!(std::fs::read(quarantine.join("a.fz")).unwrap(), b"older");

        let ledger = list_dead_letters(&pool).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].reason, "filter missing");
    }

    fn quarantine_seed(quarantine: &Path) -> PathBuf {
        std::fs::create_dir_all(quarantine).unwrap();
        quarantine.join("a.fz")
    }

    #[tokio::test]
    async fn test_missing_source_still_records() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database_pool(&temp_dir.path().join("coma.db")).await.unwrap();
        let sink = SqliteDeadLetterSink::new(pool.clone(), temp_dir.path().join("dead"));

        let entry = DeadLetterEntry::new(
            temp_dir.path().join("gone.fz"),
            "describe failed".to_string(),
            PipelineState::Described,
        );
        sink.park(&entry).await.unwrap();

        assert_eq!(list_dead_letters(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_parks_keep_same_named_sources() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database_pool(&temp_dir.path().join("coma.db")).await.unwrap();
        let quarantine = temp_dir.path().join("dead");
        let sink = Arc::new(SqliteDeadLetterSink::new(pool.clone(), &quarantine));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let night = temp_dir.path().join("staging").join(format!("n{}", i));
                std::fs::create_dir_all(&night).unwrap();
                let source = night.join("obs.fz");
                std::fs::write(&source, format!("exposure {}", i)).unwrap();

                let sink = sink.clone();
                tokio::spawn(async move {
                    let entry = DeadLetterEntry::new(source, "filter missing".to_string(), PipelineState::Normalized);
                    sink.park(&entry).await.unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let contents: std::collections::HashSet<String> = std::fs::read_dir(&quarantine)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert_eq!(contents.len(), 64);
        assert_eq!(list_dead_letters(&pool).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_memory_sink_accepts_concurrent_appends() {
        let sink = Arc::new(MemoryDeadLetterSink::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let entry = DeadLetterEntry::new(
                        PathBuf::from(format!("/staging/{}.fz", i)),
                        "timeout".to_string(),
                        PipelineState::Calibrated,
                    );
                    sink.park(&entry).await.unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(sink.entries().await.len(), 16);
    }
}
