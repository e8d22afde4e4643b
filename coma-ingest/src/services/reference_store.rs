//! Reference store lookups
//!
//! Exact-match natural-key lookups against the catalogue reference tables.
//! The pipeline only ever reads; administration of the tables happens
//! elsewhere.
//!
//! A `None` from a store means the key is absent. The resolver turns that
//! into [`ReferenceError::NotFound`], which is fatal to the owning record and
//! never defaulted.

use crate::designation::CanonicalDesignation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Kind of reference being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Object,
    Instrument,
    Telescope,
    Filter,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Object => "object",
            ReferenceKind::Instrument => "instrument",
            ReferenceKind::Telescope => "telescope",
            ReferenceKind::Filter => "filter",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("{0} reference not found")]
    NotFound(ReferenceKind),

    /// Store unreachable or query failed; not a statement about the key
    #[error("Reference store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for ReferenceError {
    fn from(err: sqlx::Error) -> Self {
        ReferenceError::Unavailable(err.to_string())
    }
}

/// Catalogue entry of the observed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueRef {
    pub object_id: i64,
    pub pds4_lid: Option<String>,
}

impl CatalogueRef {
    /// Identifier used as the top-level archive directory
    pub fn archive_key(&self) -> String {
        match self.pds4_lid.as_deref().map(str::trim) {
            Some(lid) if !lid.is_empty() => lid.to_string(),
            _ => self.object_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub instrument_id: i64,
    pub telescope_id: Option<i64>,
}

/// Surrogate ids for everything a record refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReferences {
    pub object: CatalogueRef,
    pub instrument_id: i64,
    pub telescope_id: i64,
    pub filter_id: i64,
}

/// Read-only reference lookups
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Connectivity check used before a run
    async fn ping(&self) -> Result<(), ReferenceError>;

    async fn find_object(&self, name: &str) -> Result<Option<CatalogueRef>, ReferenceError>;

    /// Case-insensitive lookup by instrument name
    async fn find_instrument(&self, name: &str) -> Result<Option<InstrumentRef>, ReferenceError>;

    async fn telescope_exists(&self, telescope_id: i64) -> Result<bool, ReferenceError>;

    async fn find_filter(&self, code: &str, telescope_id: i64) -> Result<Option<i64>, ReferenceError>;
}

/// Resolve object, instrument, telescope and filter for one record
///
/// Lookups run in dependency order (the filter is scoped by the
/// instrument's telescope) and stop at the first miss.
pub async fn resolve_references(
    store: &dyn ReferenceStore,
    identity: &CanonicalDesignation,
    instrument: &str,
    filter: &str,
) -> Result<ResolvedReferences, ReferenceError> {
    let object = store
        .find_object(identity.as_str())
        .await?
        .ok_or(ReferenceError::NotFound(ReferenceKind::Object))?;

    let instrument = store
        .find_instrument(instrument)
        .await?
        .ok_or(ReferenceError::NotFound(ReferenceKind::Instrument))?;

    let telescope_id = instrument
        .telescope_id
        .ok_or(ReferenceError::NotFound(ReferenceKind::Telescope))?;
    if !store.telescope_exists(telescope_id).await? {
        return Err(ReferenceError::NotFound(ReferenceKind::Telescope));
    }

    let filter_id = store
        .find_filter(filter, telescope_id)
        .await?
        .ok_or(ReferenceError::NotFound(ReferenceKind::Filter))?;

    Ok(ResolvedReferences {
        object,
        instrument_id: instrument.instrument_id,
        telescope_id,
        filter_id,
    })
}

/// SQLite-backed reference store
pub struct SqliteReferenceStore {
    pool: SqlitePool,
}

impl SqliteReferenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferenceStore for SqliteReferenceStore {
    async fn ping(&self) -> Result<(), ReferenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_object(&self, name: &str) -> Result<Option<CatalogueRef>, ReferenceError> {
        let row: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT object_id, pds4_lid FROM objects WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(object_id, pds4_lid)| CatalogueRef { object_id, pds4_lid }))
    }

    async fn find_instrument(&self, name: &str) -> Result<Option<InstrumentRef>, ReferenceError> {
        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT instrument_id, telescope_id FROM instruments WHERE name = ? COLLATE NOCASE",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(instrument_id, telescope_id)| InstrumentRef {
            instrument_id,
            telescope_id,
        }))
    }

    async fn telescope_exists(&self, telescope_id: i64) -> Result<bool, ReferenceError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT telescope_id FROM telescopes WHERE telescope_id = ?")
            .bind(telescope_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn find_filter(&self, code: &str, telescope_id: i64) -> Result<Option<i64>, ReferenceError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT filter_id FROM filters WHERE code = ? AND telescope_id = ?")
                .bind(code)
                .bind(telescope_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(filter_id,)| filter_id))
    }
}

#[derive(Default)]
struct CacheTables {
    objects: HashMap<String, CatalogueRef>,
    instruments: HashMap<String, InstrumentRef>,
    telescopes: HashSet<i64>,
    filters: HashMap<(String, i64), i64>,
}

/// Read-shared lookup cache in front of any [`ReferenceStore`]
///
/// Only found entries are cached, so a reference added to the store is
/// picked up without a refresh. [`refresh`](Self::refresh) drops everything.
pub struct ReferenceCache {
    inner: Arc<dyn ReferenceStore>,
    tables: RwLock<CacheTables>,
}

impl ReferenceCache {
    pub fn new(inner: Arc<dyn ReferenceStore>) -> Self {
        Self {
            inner,
            tables: RwLock::new(CacheTables::default()),
        }
    }

    pub async fn refresh(&self) {
        *self.tables.write().await = CacheTables::default();
        tracing::debug!("Reference cache cleared");
    }

    pub async fn len(&self) -> usize {
        let tables = self.tables.read().await;
        tables.objects.len() + tables.instruments.len() + tables.telescopes.len() + tables.filters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ReferenceStore for ReferenceCache {
    async fn ping(&self) -> Result<(), ReferenceError> {
        self.inner.ping().await
    }

    async fn find_object(&self, name: &str) -> Result<Option<CatalogueRef>, ReferenceError> {
        if let Some(hit) = self.tables.read().await.objects.get(name) {
            return Ok(Some(hit.clone()));
        }
        let found = self.inner.find_object(name).await?;
        if let Some(found) = &found {
            self.tables.write().await.objects.insert(name.to_string(), found.clone());
        }
        Ok(found)
    }

    async fn find_instrument(&self, name: &str) -> Result<Option<InstrumentRef>, ReferenceError> {
        let key = name.trim().to_lowercase();
        if let Some(hit) = self.tables.read().await.instruments.get(&key) {
            return Ok(Some(*hit));
        }
        let found = self.inner.find_instrument(name).await?;
        if let Some(found) = found {
            self.tables.write().await.instruments.insert(key, found);
        }
        Ok(found)
    }

    async fn telescope_exists(&self, telescope_id: i64) -> Result<bool, ReferenceError> {
        if self.tables.read().await.telescopes.contains(&telescope_id) {
            return Ok(true);
        }
        let exists = self.inner.telescope_exists(telescope_id).await?;
        if exists {
            self.tables.write().await.telescopes.insert(telescope_id);
        }
        Ok(exists)
    }

    async fn find_filter(&self, code: &str, telescope_id: i64) -> Result<Option<i64>, ReferenceError> {
        let key = (code.to_string(), telescope_id);
        if let Some(hit) = self.tables.read().await.filters.get(&key) {
            return Ok(Some(*hit));
        }
        let found = self.inner.find_filter(code, telescope_id).await?;
        if let Some(filter_id) = found {
            self.tables.write().await.filters.insert(key, filter_id);
        }
        Ok(found)
    }
}
