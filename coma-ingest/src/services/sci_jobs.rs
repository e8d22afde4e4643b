//! Typed requests and results for the scientific-processing jobs
//!
//! Thin layer over [`JobClient`]: builds each kind's payload and decodes its
//! result. The measurement fan-out (photometry, ephemeris and the
//! orbit → coordinates chain) lives here too.

use crate::config::{OrbitConfig, PhotometryConfig};
use crate::designation::CanonicalDesignation;
use crate::flight_checks::ExposureTiming;
use crate::models::Description;
use crate::services::job_client::{JobClient, JobError, JobKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Calibration quality metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    #[serde(rename = "PARAMETERS")]
    pub parameters: Map<String, Value>,
}

/// One aperture's measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryMeasurement {
    pub aperture: f64,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PhotometryResult {
    #[serde(rename = "PHOTOMETRY")]
    photometry: Vec<PhotometryMeasurement>,
}

/// Ephemeris at the exposure window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ephemeris {
    /// Heliocentric distance (au)
    pub r: f64,
    /// Geocentric distance (au)
    pub delta: f64,
    /// Phase angle (deg)
    pub phase: f64,
    pub ra: f64,
    pub dec: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitSolution {
    pub elements: Map<String, Value>,
}

/// Heliocentric position sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSample {
    /// MJD of the sample
    pub epoch: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Deserialize)]
struct CoordinatesResult {
    samples: Vec<CoordinateSample>,
}

/// Everything the Measured stage produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub photometry: Vec<PhotometryMeasurement>,
    pub ephemeris: Ephemeris,
    pub orbit: OrbitSolution,
    pub coordinates: Vec<CoordinateSample>,
}

impl Measurements {
    /// Coordinate sample closest in time to `mjd`
    pub fn nearest_sample(&self, mjd: f64) -> Option<&CoordinateSample> {
        self.coordinates
            .iter()
            .min_by(|a, b| (a.epoch - mjd).abs().total_cmp(&(b.epoch - mjd).abs()))
    }
}

#[derive(Debug, Deserialize)]
struct DescribeResult {
    #[serde(rename = "PARAMETERS")]
    parameters: Description,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdentifyResult {
    Name(String),
    Named { name: String },
}

/// Inputs of the identification job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyRequest {
    pub object: String,
    pub mjd: f64,
    pub ra: f64,
    pub dec: f64,
}

/// Typed job API
#[derive(Clone)]
pub struct ScienceJobs {
    client: JobClient,
    photometry: PhotometryConfig,
    orbit: OrbitConfig,
}

impl ScienceJobs {
    pub fn new(client: JobClient, photometry: PhotometryConfig, orbit: OrbitConfig) -> Self {
        Self {
            client,
            photometry,
            orbit,
        }
    }

    pub fn client(&self) -> &JobClient {
        &self.client
    }

    pub async fn describe(&self, fits_file: &Path, cancel: &CancellationToken) -> Result<Description, JobError> {
        let payload = json!({ "fits_file": fits_file.to_string_lossy() });
        let result: DescribeResult = self
            .client
            .submit_and_parse(JobKind::Describe, payload, cancel)
            .await?;
        Ok(result.parameters)
    }

    pub async fn identify(
        &self,
        request: &IdentifyRequest,
        cancel: &CancellationToken,
    ) -> Result<CanonicalDesignation, JobError> {
        let payload = serde_json::to_value(request).map_err(|e| JobError::Malformed {
            kind: JobKind::Identify,
            detail: e.to_string(),
        })?;
        let result: IdentifyResult = self
            .client
            .submit_and_parse(JobKind::Identify, payload, cancel)
            .await?;

        let name = match result {
            IdentifyResult::Name(name) | IdentifyResult::Named { name } => name.trim().to_string(),
        };
        if name.is_empty() {
            return Err(JobError::Malformed {
                kind: JobKind::Identify,
                detail: "empty designation".to_string(),
            });
        }
        Ok(CanonicalDesignation::new(name))
    }

    pub async fn calibrate(&self, fits_file: &Path, cancel: &CancellationToken) -> Result<CalibrationResult, JobError> {
        let payload = json!({ "fits_file": fits_file.to_string_lossy() });
        self.client
            .submit_and_parse(JobKind::Calibrate, payload, cancel)
            .await
    }

    pub async fn photometry(
        &self,
        fits_file: &Path,
        object: &CanonicalDesignation,
        cancel: &CancellationToken,
    ) -> Result<Vec<PhotometryMeasurement>, JobError> {
        let payload = json!({
            "fits_file": fits_file.to_string_lossy(),
            "object": object.as_str(),
            "apertures": self.photometry.apertures,
            "method": self.photometry.method,
        });
        let result: PhotometryResult = self
            .client
            .submit_and_parse(JobKind::Photometry, payload, cancel)
            .await?;
        Ok(result.photometry)
    }

    pub async fn orbit(&self, object: &CanonicalDesignation, cancel: &CancellationToken) -> Result<OrbitSolution, JobError> {
        let payload = json!({
            "object": object.as_str(),
            "method": self.orbit.method,
        });
        self.client.submit_and_parse(JobKind::Orbit, payload, cancel).await
    }

    pub async fn ephemeris(
        &self,
        object: &CanonicalDesignation,
        window: &ExposureTiming,
        station_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Ephemeris, JobError> {
        let payload = json!({
            "object": object.as_str(),
            "start": window.start.format(WINDOW_FORMAT).to_string(),
            "stop": window.end.format(WINDOW_FORMAT).to_string(),
            "obscode": station_code,
        });
        self.client
            .submit_and_parse(JobKind::Ephemeris, payload, cancel)
            .await
    }

    pub async fn coordinates(
        &self,
        orbit: &OrbitSolution,
        object: &CanonicalDesignation,
        cancel: &CancellationToken,
    ) -> Result<Vec<CoordinateSample>, JobError> {
        let payload = json!({
            "orbit": orbit.elements,
            "object": object.as_str(),
            "thresholds": self.orbit.thresholds,
        });
        let result: CoordinatesResult = self
            .client
            .submit_and_parse(JobKind::Coordinates, payload, cancel)
            .await?;
        Ok(result.samples)
    }

    /// Run photometry, ephemeris and orbit → coordinates concurrently
    ///
    /// The first failure cancels the remaining jobs.
    pub async fn measure(
        &self,
        fits_file: &Path,
        object: &CanonicalDesignation,
        window: &ExposureTiming,
        station_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Measurements, JobError> {
        let siblings = cancel.child_token();

        let orbit_chain = async {
            let orbit = self.orbit(object, &siblings).await?;
            let coordinates = self.coordinates(&orbit, object, &siblings).await?;
            Ok::<_, JobError>((orbit, coordinates))
        };

        let joined = tokio::try_join!(
            self.photometry(fits_file, object, &siblings),
            self.ephemeris(object, window, station_code, &siblings),
            orbit_chain,
        );

        match joined {
            Ok((photometry, ephemeris, (orbit, coordinates))) => Ok(Measurements {
                photometry,
                ephemeris,
                orbit,
                coordinates,
            }),
            Err(e) => {
                siblings.cancel();
                Err(e)
            }
        }
    }
}
