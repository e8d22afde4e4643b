//! Persistence writer
//!
//! Submission order is image → calibration → photometry*. Each later record
//! carries the id returned for the earlier one, so a failed submission stops
//! the chain instead of leaving dangling references.

use crate::error::StageFailure;
use crate::models::ObservationRecord;
use crate::services::sci_jobs::{CalibrationResult, Ephemeris, Measurements, PhotometryMeasurement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("coma-ingest/", env!("CARGO_PKG_VERSION"));
const EXPOSURE_WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file_name: String,
    pub archive_path: String,
    pub designation: String,
    pub object_id: i64,
    pub pds4_lid: Option<String>,
    pub instrument_id: i64,
    pub telescope_id: i64,
    pub filter_id: i64,
    pub observatory: String,
    pub obscode: String,
    pub observation_type: String,
    pub mjd_mid: f64,
    pub iso_date_mid: String,
    pub exposure_time: f64,
    pub exposure_start: String,
    pub exposure_end: String,
}

impl ImageRecord {
    /// Assemble from a record that has reached Archived
    pub fn from_record(record: &ObservationRecord, archive_path: &Path) -> Result<Self, StageFailure> {
        let identity = record.identity()?;
        let observation = record.observation()?;
        let references = record.references()?;
        let normalized = &observation.normalized;
        let timing = &observation.timing;

        Ok(Self {
            file_name: record.file_name(),
            archive_path: archive_path.to_string_lossy().to_string(),
            designation: identity.to_string(),
            object_id: references.object.object_id,
            pds4_lid: references.object.pds4_lid.clone(),
            instrument_id: references.instrument_id,
            telescope_id: references.telescope_id,
            filter_id: references.filter_id,
            observatory: normalized.observatory().to_string(),
            obscode: normalized.station_code().to_string(),
            observation_type: normalized.observation_type.to_string(),
            mjd_mid: normalized.mjd_mid(),
            iso_date_mid: normalized.iso_date_mid.clone(),
            exposure_time: normalized.exposure_time(),
            exposure_start: timing.start.format(EXPOSURE_WINDOW_FORMAT).to_string(),
            exposure_end: timing.end.format(EXPOSURE_WINDOW_FORMAT).to_string(),
        })
    }
}

/// Calibration record, linked to its image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub image_id: i64,
    pub parameters: Map<String, Value>,
}

/// One photometry record per aperture measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryRecord {
    pub image_id: i64,
    pub calibration_id: i64,
    pub aperture: f64,
    pub measurement: Map<String, Value>,
    pub r: f64,
    pub delta: f64,
    pub phase: f64,
    pub ephemeris_ra: f64,
    pub ephemeris_dec: f64,
    pub helio_epoch: Option<f64>,
    pub helio_x: Option<f64>,
    pub helio_y: Option<f64>,
    pub helio_z: Option<f64>,
}

impl PhotometryRecord {
    fn build(
        image_id: i64,
        calibration_id: i64,
        measurement: &PhotometryMeasurement,
        ephemeris: &Ephemeris,
        measurements: &Measurements,
        mjd_mid: f64,
    ) -> Self {
        let sample = measurements.nearest_sample(mjd_mid);
        Self {
            image_id,
            calibration_id,
            aperture: measurement.aperture,
            measurement: measurement.values.clone(),
            r: ephemeris.r,
            delta: ephemeris.delta,
            phase: ephemeris.phase,
            ephemeris_ra: ephemeris.ra,
            ephemeris_dec: ephemeris.dec,
            helio_epoch: sample.map(|s| s.epoch),
            helio_x: sample.map(|s| s.x),
            helio_y: sample.map(|s| s.y),
            helio_z: sample.map(|s| s.z),
        }
    }
}

/// Ids returned by the write API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReceipt {
    pub image_id: i64,
    pub calibration_id: i64,
    pub photometry_ids: Vec<i64>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Write API rejected {record} record: HTTP {status}: {body}")]
    Rejected {
        record: &'static str,
        status: u16,
        body: String,
    },

    #[error("Write API request for {record} record failed: {detail}")]
    Network { record: &'static str, detail: String },

    #[error("Write API returned no id for {record} record: {detail}")]
    Malformed { record: &'static str, detail: String },
}

/// Data-store write seam
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn submit_image(&self, image: &ImageRecord) -> Result<i64, PersistError>;
    async fn submit_calibration(&self, calibration: &CalibrationRecord) -> Result<i64, PersistError>;
    async fn submit_photometry(&self, photometry: &PhotometryRecord) -> Result<i64, PersistError>;
}

/// Write API client authenticated with a bearer token
pub struct HttpRecordWriter {
    http_client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRecordWriter {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, record: &'static str, path: &str, body: &T) -> Result<i64, PersistError> {
        let mut request = self
            .http_client
            .post(format!("{}/{}", self.base_url, path))
            .json(body);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await.map_err(|e| PersistError::Network {
            record,
            detail: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                record,
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(|e| PersistError::Malformed {
            record,
            detail: e.to_string(),
        })?;

        body.get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PersistError::Malformed {
                record,
                detail: body.to_string(),
            })
    }
}

#[async_trait]
impl RecordWriter for HttpRecordWriter {
    async fn submit_image(&self, image: &ImageRecord) -> Result<i64, PersistError> {
        self.post("image", "images", image).await
    }

    async fn submit_calibration(&self, calibration: &CalibrationRecord) -> Result<i64, PersistError> {
        self.post("calibration", "calibrations", calibration).await
    }

    async fn submit_photometry(&self, photometry: &PhotometryRecord) -> Result<i64, PersistError> {
        self.post("photometry", "photometry", photometry).await
    }
}

#[derive(Clone)]
pub struct PersistenceWriter {
    writer: Arc<dyn RecordWriter>,
}

impl PersistenceWriter {
    pub fn new(writer: Arc<dyn RecordWriter>) -> Self {
        Self { writer }
    }

    /// Submit image, calibration and one photometry record per measurement
    pub async fn persist(
        &self,
        image: &ImageRecord,
        calibration: &CalibrationResult,
        measurements: &Measurements,
    ) -> Result<PersistReceipt, PersistError> {
        let image_id = self.writer.submit_image(image).await?;

        let calibration_id = self
            .writer
            .submit_calibration(&CalibrationRecord {
                image_id,
                parameters: calibration.parameters.clone(),
            })
            .await?;

        let mut photometry_ids = Vec::with_capacity(measurements.photometry.len());
        for measurement in &measurements.photometry {
            let record = PhotometryRecord::build(
                image_id,
                calibration_id,
                measurement,
                &measurements.ephemeris,
                measurements,
                image.mjd_mid,
            );
            photometry_ids.push(self.writer.submit_photometry(&record).await?);
        }

        tracing::debug!(
            image_id,
            calibration_id,
            photometry_records = photometry_ids.len(),
            "Records submitted"
        );

        Ok(PersistReceipt {
            image_id,
            calibration_id,
            photometry_ids,
        })
    }
}
