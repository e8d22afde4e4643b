//! Dead-letter ledger persistence

use crate::models::PipelineState;
use crate::services::dead_letter::DeadLetterEntry;
use chrono::{DateTime, Utc};
use coma_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use uuid::Uuid;

/// Append one entry, returning its row id
pub async fn insert_dead_letter(pool: &SqlitePool, entry: &DeadLetterEntry) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO dead_letters (record_id, source_file, stage, reason, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.record_id.map(|id| id.to_string()))
    .bind(entry.source.to_string_lossy().to_string())
    .bind(entry.stage.as_str())
    .bind(&entry.reason)
    .bind(entry.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// All entries, oldest first
pub async fn list_dead_letters(pool: &SqlitePool) -> Result<Vec<DeadLetterEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT record_id, source_file, stage, reason, created_at
        FROM dead_letters
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let stage_name: String = row.get("stage");
            let stage = PipelineState::parse(&stage_name)
                .ok_or_else(|| Error::Internal(format!("Unknown pipeline stage in ledger: {}", stage_name)))?;

            let created_at: String = row.get("created_at");
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| Error::Internal(format!("Invalid dead-letter timestamp: {}", e)))?
                .with_timezone(&Utc);

            let record_id: Option<String> = row.get("record_id");
            let source_file: String = row.get("source_file");

            Ok(DeadLetterEntry {
                record_id: record_id.and_then(|id| Uuid::parse_str(&id).ok()),
                source: PathBuf::from(source_file),
                reason: row.get("reason"),
                stage,
                created_at,
            })
        })
        .collect()
}
