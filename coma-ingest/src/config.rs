//! Configuration resolution for coma-ingest
//!
//! Config file priority: CLI `--config` → `COMA_CONFIG` → platform config
//! directory (`coma/ingest.toml`) → compiled defaults.
//!
//! The write API bearer token additionally resolves ENV → TOML, with
//! `COMA_WRITE_TOKEN` taking precedence.

use crate::services::archive::CollisionPolicy;
use crate::services::job_client::{BackoffPolicy, JobKind};
use coma_common::config::{env_value, load_toml_or_default, resolve_config_path, LoggingConfig};
use coma_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV_VAR: &str = "COMA_CONFIG";
pub const CONFIG_FILE_NAME: &str = "ingest.toml";
pub const WRITE_TOKEN_ENV_VAR: &str = "COMA_WRITE_TOKEN";
pub const SCI_API_ENV_VAR: &str = "COMA_SCI_API_URL";

/// Complete ingest configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub paths: PathsConfig,
    pub services: ServicesConfig,
    pub jobs: JobsConfig,
    pub photometry: PhotometryConfig,
    pub orbit: OrbitConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// File-system layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Tree scanned for new exposures
    pub staging_root: PathBuf,
    /// Working copies are made here before any processing
    pub scratch_dir: PathBuf,
    /// `{archive_root}/{catalogue-ref}/{date}/{instrument}/{file}`
    pub archive_root: PathBuf,
    /// Dead-lettered source files are parked here
    pub dead_letter_dir: PathBuf,
    /// Suffix a staged file must end with
    pub file_suffix: String,
    /// SQLite database holding the reference tables and dead-letter ledger
    pub database_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/data/staging/atlas"),
            scratch_dir: PathBuf::from("/data/staging/scratch"),
            archive_root: PathBuf::from("/data/archive"),
            dead_letter_dir: PathBuf::from("/data/staging/dead_letter"),
            file_suffix: ".fz".to_string(),
            database_path: PathBuf::from("/data/coma/coma.db"),
        }
    }
}

/// External service endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Base URL of the scientific-processing job API
    pub sci_api_url: String,
    /// Base URL of the persistence write API
    pub write_api_url: String,
    /// Bearer credential for the write API
    pub write_token: String,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            sci_api_url: "http://localhost:8000/api/v2/sci".to_string(),
            write_api_url: "http://localhost:8000/api/v2/data".to_string(),
            write_token: String::new(),
            request_timeout_secs: 30,
        }
    }
}

/// Submit/poll behaviour for external jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Overall wait for a job unless overridden per kind
    pub default_timeout_secs: u64,
    /// Per-kind timeout overrides, keyed by kind name (e.g. `identify = 600`)
    pub timeouts: BTreeMap<String, u64>,
    /// Extra identification attempts after a service failure
    pub identity_retries: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let mut timeouts = BTreeMap::new();
        timeouts.insert(JobKind::Identify.as_str().to_string(), 600);
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            default_timeout_secs: 300,
            timeouts,
            identity_retries: 0,
        }
    }
}

impl JobsConfig {
    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        let secs = self
            .timeouts
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    /// Aperture radii (pixels)
    pub apertures: Vec<f64>,
    pub method: String,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            apertures: vec![2.0, 4.0, 6.0, 8.0, 10.0],
            method: "aperture".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    pub method: String,
    pub thresholds: CoordinateThresholds,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            method: "find_orb".to_string(),
            thresholds: CoordinateThresholds::default(),
        }
    }
}

/// Limits passed to the coordinate-recording job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateThresholds {
    pub max_uncertainty_arcsec: f64,
    pub sample_step_days: f64,
}

impl Default for CoordinateThresholds {
    fn default() -> Self {
        Self {
            max_uncertainty_arcsec: 10.0,
            sample_step_days: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline instances running at once
    pub concurrency: usize,
    /// Offset between exposure window start and end
    pub exposure_window_secs: u64,
    /// Staging path components marking packed-designation sources
    pub packed_sources: Vec<String>,
    pub archive_collision: CollisionPolicy,
    /// Total time spent waiting for the reference store before a run
    pub store_max_wait_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            exposure_window_secs: 60,
            packed_sources: vec!["packed".to_string()],
            archive_collision: CollisionPolicy::Fail,
            store_max_wait_ms: 30_000,
        }
    }
}

impl IngestConfig {
    /// Resolve, load, apply environment overrides and validate
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path, CONFIG_ENV_VAR, CONFIG_FILE_NAME);
        let mut config: IngestConfig = load_toml_or_default(path.as_deref())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse from TOML text (no environment overrides)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: IngestConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.services.write_token = resolve_write_token(&self.services.write_token);

        if let Some(url) = env_value(SCI_API_ENV_VAR) {
            info!("Science API URL loaded from environment variable");
            self.services.sci_api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.concurrency == 0 {
            return Err(Error::Config("pipeline.concurrency must be at least 1".to_string()));
        }
        if self.photometry.apertures.is_empty() {
            return Err(Error::Config("photometry.apertures must not be empty".to_string()));
        }
        if self.photometry.apertures.iter().any(|a| !a.is_finite() || *a <= 0.0) {
            return Err(Error::Config("photometry.apertures must be positive".to_string()));
        }
        if self.jobs.backoff_multiplier < 1.0 {
            return Err(Error::Config("jobs.backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.jobs.initial_backoff_ms == 0 || self.jobs.initial_backoff_ms > self.jobs.max_backoff_ms {
            return Err(Error::Config(
                "jobs.initial_backoff_ms must be in 1..=max_backoff_ms".to_string(),
            ));
        }
        if self.paths.file_suffix.is_empty() {
            return Err(Error::Config("paths.file_suffix must not be empty".to_string()));
        }
        if self.services.sci_api_url.trim().is_empty() {
            return Err(Error::Config("services.sci_api_url must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Resolve the write API token
///
/// **Priority:** ENV → TOML
pub fn resolve_write_token(toml_token: &str) -> String {
    let env_token = env_value(WRITE_TOKEN_ENV_VAR);
    let toml_token = Some(toml_token.trim()).filter(|t| !t.is_empty());

    match (env_token, toml_token) {
        (Some(env), Some(_)) => {
            warn!("Write API token found in environment and TOML. Using environment (highest priority).");
            env
        }
        (Some(env), None) => {
            info!("Write API token loaded from environment variable");
            env
        }
        (None, Some(toml)) => {
            info!("Write API token loaded from TOML config");
            toml.to_string()
        }
        (None, None) => {
            warn!("Write API token not configured; persistence submissions will be unauthenticated");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.paths.file_suffix, ".fz");
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.pipeline.archive_collision, CollisionPolicy::Fail);
        assert_eq!(config.jobs.identity_retries, 0);
    }

    #[test]
    fn test_per_kind_timeout_override() {
        let config = JobsConfig::default();
        assert_eq!(config.timeout_for(JobKind::Identify), Duration::from_secs(600));
        assert_eq!(config.timeout_for(JobKind::Calibrate), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = IngestConfig::from_toml_str(
            r#"
            [pipeline]
            concurrency = 8
            archive_collision = "rename"

            [photometry]
            apertures = [3.0, 5.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.concurrency, 8);
        assert_eq!(config.pipeline.archive_collision, CollisionPolicy::Rename);
        assert_eq!(config.pipeline.exposure_window_secs, 60);
        assert_eq!(config.photometry.apertures, vec![3.0, 5.0]);
        assert_eq!(config.photometry.method, "aperture");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(IngestConfig::from_toml_str("[pipeline]\nconcurrency = 0").is_err());
        assert!(IngestConfig::from_toml_str("[photometry]\napertures = []").is_err());
        assert!(IngestConfig::from_toml_str("[jobs]\nbackoff_multiplier = 0.5").is_err());
        assert!(IngestConfig::from_toml_str("[jobs]\ninitial_backoff_ms = 20000").is_err());
    }
}
