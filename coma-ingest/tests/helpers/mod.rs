//! Shared fakes and fixtures for integration tests
//!
//! - [`FakeJobs`]: scripted science API, results per job kind
//! - [`MemoryReferenceStore`]: in-memory catalogue
//! - [`RecordingWriter`]: write API that keeps what it was sent
//! - [`TestEnv`]: temporary staging/scratch/archive tree plus config

#![allow(dead_code)]

use async_trait::async_trait;
use coma_common::events::EventBus;
use coma_ingest::config::IngestConfig;
use coma_ingest::services::persistence::{CalibrationRecord, PhotometryRecord};
use coma_ingest::services::{
    CatalogueRef, DeadLetterSink, ImageRecord, IngestOrchestrator, JobError, JobKind, JobService, JobStatus,
    PersistError, PipelineDeps, RecordWriter, ReferenceError, ReferenceStore,
};
use coma_ingest::services::reference_store::InstrumentRef;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const OBJECT_NAME: &str = "C/2020 A01";
pub const OBJECT_LID: &str = "c2020a01";
pub const INSTRUMENT: &str = "ACAM1";
pub const FILTER: &str = "o";
pub const TELESCOPE_ID: i64 = 3;

/// Header every scripted describe job returns unless overridden per file
pub fn complete_header() -> Value {
    json!({
        "OBSERVATORY": "ATLAS-MLO",
        "OBSCODE": "T08",
        "INSTRUMENT": INSTRUMENT,
        "MJD-MID": 59000.25,
        "EXPTIME": 30.0,
        "FILTER": FILTER,
        "IMAGETYP": "OBJECT",
        "REDUCED": "T",
        "ORIGINAL-OBJECT-RAW": "CK20A010",
        "RA-J2000-APPROX": 150.5,
        "DEC-J2000-APPROX": -12.25
    })
}

fn default_results() -> HashMap<JobKind, Value> {
    HashMap::from([
        (JobKind::Identify, json!({ "name": OBJECT_NAME })),
        (
            JobKind::Calibrate,
            json!({ "PARAMETERS": { "ZEROPOINT": 25.12, "SEEING": 1.4 } }),
        ),
        (
            JobKind::Photometry,
            json!({ "PHOTOMETRY": [
                { "aperture": 2.0, "MAG": 15.31, "MAGERR": 0.02 },
                { "aperture": 4.0, "MAG": 15.02, "MAGERR": 0.03 },
                { "aperture": 6.0, "MAG": 14.95, "MAGERR": 0.04 }
            ] }),
        ),
        (
            JobKind::Ephemeris,
            json!({ "r": 1.52, "delta": 0.81, "phase": 33.1, "ra": 150.49, "dec": -12.26 }),
        ),
        (JobKind::Orbit, json!({ "elements": { "q": 1.21, "e": 0.998, "i": 64.2 } })),
        (
            JobKind::Coordinates,
            json!({ "samples": [
                { "epoch": 58999.0, "x": 1.0, "y": 0.1, "z": 0.0 },
                { "epoch": 59000.0, "x": 1.1, "y": 0.2, "z": 0.0 },
                { "epoch": 59001.0, "x": 1.2, "y": 0.3, "z": 0.0 }
            ] }),
        ),
    ])
}

/// Scripted science API
///
/// Every job is ready on its first poll unless `hold` is set for its kind.
pub struct FakeJobs {
    results: Mutex<HashMap<JobKind, Value>>,
    headers: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<JobKind, String>>,
    held: Mutex<HashSet<JobKind>>,
    jobs: Mutex<HashMap<String, (JobKind, Value)>>,
    submitted: Mutex<Vec<(JobKind, Value)>>,
    next_id: AtomicUsize,
    describe_delay: Mutex<Duration>,
    describes_in_flight: AtomicUsize,
    max_describes_in_flight: AtomicUsize,
}

impl FakeJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(default_results()),
            headers: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            jobs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            describe_delay: Mutex::new(Duration::ZERO),
            describes_in_flight: AtomicUsize::new(0),
            max_describes_in_flight: AtomicUsize::new(0),
        })
    }

    /// Header for one file name, replacing [`complete_header`]
    pub fn set_header(&self, file_name: &str, header: Value) {
        self.headers.lock().unwrap().insert(file_name.to_string(), header);
    }

    pub fn set_result(&self, kind: JobKind, result: Value) {
        self.results.lock().unwrap().insert(kind, result);
    }

    /// Every job of `kind` reports failure
    pub fn fail(&self, kind: JobKind, reason: &str) {
        self.failures.lock().unwrap().insert(kind, reason.to_string());
    }

    /// Jobs of `kind` stay pending forever
    pub fn hold(&self, kind: JobKind) {
        self.held.lock().unwrap().insert(kind);
    }

    pub fn set_describe_delay(&self, delay: Duration) {
        *self.describe_delay.lock().unwrap() = delay;
    }

    pub fn submitted(&self, kind: JobKind) -> Vec<Value> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn max_describes_in_flight(&self) -> usize {
        self.max_describes_in_flight.load(Ordering::SeqCst)
    }

    fn describe_result(&self, payload: &Value) -> Value {
        let file_name = payload
            .get("fits_file")
            .and_then(Value::as_str)
            .and_then(|path| Path::new(path).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let header = self
            .headers
            .lock()
            .unwrap()
            .get(&file_name)
            .cloned()
            .unwrap_or_else(complete_header);
        json!({ "PARAMETERS": header })
    }
}

#[async_trait]
impl JobService for FakeJobs {
    async fn submit(&self, kind: JobKind, payload: &Value) -> Result<String, JobError> {
        let job_id = format!("{}-{}", kind, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), (kind, payload.clone()));
        self.submitted.lock().unwrap().push((kind, payload.clone()));
        Ok(job_id)
    }

    async fn fetch(&self, kind: JobKind, job_id: &str) -> Result<JobStatus, JobError> {
        let payload = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| JobError::Http {
                kind,
                status: Some(404),
                detail: format!("unknown job {}", job_id),
            })?;

        if kind == JobKind::Describe {
            let delay = *self.describe_delay.lock().unwrap();
            let now = self.describes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_describes_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.describes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if self.held.lock().unwrap().contains(&kind) {
            return Ok(JobStatus::Pending);
        }
        if let Some(reason) = self.failures.lock().unwrap().get(&kind) {
            return Ok(JobStatus::Failed(reason.clone()));
        }

        let result = match kind {
            JobKind::Describe => self.describe_result(&payload),
            _ => self
                .results
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or(Value::Null),
        };
        Ok(JobStatus::Ready(result))
    }
}

/// In-memory catalogue
#[derive(Default)]
pub struct MemoryReferenceStore {
    objects: Mutex<HashMap<String, CatalogueRef>>,
    instruments: Mutex<HashMap<String, InstrumentRef>>,
    telescopes: Mutex<HashSet<i64>>,
    filters: Mutex<HashMap<(String, i64), i64>>,
    unavailable: AtomicBool,
    lookups_unavailable: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryReferenceStore {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Catalogue knowing the object, instrument, telescope and filter of
    /// [`complete_header`]
    pub fn standard() -> Arc<Self> {
        let store = Self::default();
        store.add_object(OBJECT_NAME, 7, Some(OBJECT_LID));
        store.add_instrument(INSTRUMENT, 1, Some(TELESCOPE_ID));
        store.add_telescope(TELESCOPE_ID);
        store.add_filter(FILTER, TELESCOPE_ID, 11);
        Arc::new(store)
    }

    pub fn add_object(&self, name: &str, object_id: i64, pds4_lid: Option<&str>) {
        self.objects.lock().unwrap().insert(
            name.to_string(),
            CatalogueRef {
                object_id,
                pds4_lid: pds4_lid.map(str::to_string),
            },
        );
    }

    pub fn add_instrument(&self, name: &str, instrument_id: i64, telescope_id: Option<i64>) {
        self.instruments.lock().unwrap().insert(
            name.to_lowercase(),
            InstrumentRef {
                instrument_id,
                telescope_id,
            },
        );
    }

    pub fn remove_instrument(&self, name: &str) {
        self.instruments.lock().unwrap().remove(&name.to_lowercase());
    }

    pub fn add_telescope(&self, telescope_id: i64) {
        self.telescopes.lock().unwrap().insert(telescope_id);
    }

    pub fn add_filter(&self, code: &str, telescope_id: i64, filter_id: i64) {
        self.filters
            .lock()
            .unwrap()
            .insert((code.to_string(), telescope_id), filter_id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Ping keeps answering, lookups fail
    pub fn set_lookups_unavailable(&self, unavailable: bool) {
        self.lookups_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ReferenceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) || self.lookups_unavailable.load(Ordering::SeqCst) {
            return Err(ReferenceError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn ping(&self) -> Result<(), ReferenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReferenceError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn find_object(&self, name: &str) -> Result<Option<CatalogueRef>, ReferenceError> {
        self.check()?;
        Ok(self.objects.lock().unwrap().get(name).cloned())
    }

    async fn find_instrument(&self, name: &str) -> Result<Option<InstrumentRef>, ReferenceError> {
        self.check()?;
        Ok(self.instruments.lock().unwrap().get(&name.to_lowercase()).copied())
    }

    async fn telescope_exists(&self, telescope_id: i64) -> Result<bool, ReferenceError> {
        self.check()?;
        Ok(self.telescopes.lock().unwrap().contains(&telescope_id))
    }

    async fn find_filter(&self, code: &str, telescope_id: i64) -> Result<Option<i64>, ReferenceError> {
        self.check()?;
        Ok(self
            .filters
            .lock()
            .unwrap()
            .get(&(code.to_string(), telescope_id))
            .copied())
    }
}

/// Write API fake; ids count up from 1 per record type
#[derive(Default)]
pub struct RecordingWriter {
    pub images: Mutex<Vec<ImageRecord>>,
    pub calibrations: Mutex<Vec<CalibrationRecord>>,
    pub photometry: Mutex<Vec<PhotometryRecord>>,
    reject_images: AtomicBool,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_images(&self) {
        self.reject_images.store(true, Ordering::SeqCst);
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    pub fn photometry_count(&self) -> usize {
        self.photometry.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordWriter for RecordingWriter {
    async fn submit_image(&self, image: &ImageRecord) -> Result<i64, PersistError> {
        if self.reject_images.load(Ordering::SeqCst) {
            return Err(PersistError::Rejected {
                record: "image",
                status: 422,
                body: "duplicate image".to_string(),
            });
        }
        let mut images = self.images.lock().unwrap();
        images.push(image.clone());
        Ok(images.len() as i64)
    }

    async fn submit_calibration(&self, calibration: &CalibrationRecord) -> Result<i64, PersistError> {
        let mut calibrations = self.calibrations.lock().unwrap();
        calibrations.push(calibration.clone());
        Ok(calibrations.len() as i64)
    }

    async fn submit_photometry(&self, photometry: &PhotometryRecord) -> Result<i64, PersistError> {
        let mut stored = self.photometry.lock().unwrap();
        stored.push(photometry.clone());
        Ok(stored.len() as i64)
    }
}

/// Temporary directory tree and a config pointing into it
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config: IngestConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut config = IngestConfig::default();
        config.paths.staging_root = root.join("staging");
        config.paths.scratch_dir = root.join("scratch");
        config.paths.archive_root = root.join("archive");
        config.paths.dead_letter_dir = root.join("dead-letter");
        config.paths.database_path = root.join("coma.db");
        config.jobs.initial_backoff_ms = 1;
        config.jobs.max_backoff_ms = 5;
        config.jobs.default_timeout_secs = 5;
        config.jobs.timeouts.clear();
        config.pipeline.concurrency = 2;
        config.pipeline.store_max_wait_ms = 50;

        std::fs::create_dir_all(&config.paths.staging_root).unwrap();

        Self { temp_dir, config }
    }

    pub fn staging(&self) -> &Path {
        &self.config.paths.staging_root
    }

    pub fn archive_root(&self) -> &Path {
        &self.config.paths.archive_root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.config.paths.scratch_dir
    }

    /// Create a staged file at `relative` (below the staging root)
    pub fn stage_file(&self, relative: &str) -> PathBuf {
        let path = self.staging().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"SIMPLE  =                    T").unwrap();
        path
    }

    pub fn orchestrator(
        &self,
        jobs: Arc<FakeJobs>,
        references: Arc<MemoryReferenceStore>,
        writer: Arc<RecordingWriter>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> IngestOrchestrator {
        let deps = PipelineDeps {
            jobs,
            references,
            writer,
            dead_letters,
        };
        IngestOrchestrator::new(&self.config, deps, EventBus::new(256))
    }
}

/// Number of regular files below `dir`
pub fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count()
}
