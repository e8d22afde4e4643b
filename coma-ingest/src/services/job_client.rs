//! External job client
//!
//! Every scientific-processing service speaks the same two-phase protocol:
//!
//! 1. `POST {base}/{endpoint}` with a kind-specific JSON body → `{"id": ...}`
//! 2. `GET {base}/{endpoint}/{id}` until `{"result": ...}` is non-null
//!
//! [`JobService`] is the transport seam (HTTP in production, scripted fakes in
//! tests). [`JobClient`] owns the polling policy: bounded exponential backoff,
//! an overall per-kind timeout and cancellation tied to the owning record.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;

const USER_AGENT: &str = concat!("coma-ingest/", env!("CARGO_PKG_VERSION"));

/// Kind of external job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Describe,
    Identify,
    Calibrate,
    Photometry,
    Orbit,
    Ephemeris,
    Coordinates,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::Describe,
        JobKind::Identify,
        JobKind::Calibrate,
        JobKind::Photometry,
        JobKind::Orbit,
        JobKind::Ephemeris,
        JobKind::Coordinates,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Describe => "describe",
            JobKind::Identify => "identify",
            JobKind::Calibrate => "calibrate",
            JobKind::Photometry => "photometry",
            JobKind::Orbit => "orbit",
            JobKind::Ephemeris => "ephemeris",
            JobKind::Coordinates => "coordinates",
        }
    }

    /// Endpoint path relative to the science API base URL
    pub fn endpoint(self) -> &'static str {
        match self {
            JobKind::Describe => "fits/describe",
            JobKind::Identify => "fits/identify",
            JobKind::Calibrate => "fits/calibrate",
            JobKind::Photometry => "fits/photometry",
            JobKind::Orbit => "orbit",
            JobKind::Ephemeris => "ephemeris",
            JobKind::Coordinates => "orbit/coordinates",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status as reported by one poll
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Ready(Value),
    Failed(String),
}

/// External job errors
///
/// All variants are fatal to the owning record only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("{kind} job timed out after {waited_ms} ms")]
    Timeout { kind: JobKind, waited_ms: u64 },

    #[error("{kind} job {job_id} failed: {reason}")]
    Failed {
        kind: JobKind,
        job_id: String,
        reason: String,
    },

    #[error("{kind} returned a malformed payload: {detail}")]
    Malformed { kind: JobKind, detail: String },

    #[error("{kind} service request failed: {detail}")]
    Http {
        kind: JobKind,
        status: Option<u16>,
        detail: String,
    },

    #[error("{kind} job cancelled")]
    Cancelled { kind: JobKind },
}

impl JobError {
    pub fn kind(&self) -> JobKind {
        match self {
            JobError::Timeout { kind, .. }
            | JobError::Failed { kind, .. }
            | JobError::Malformed { kind, .. }
            | JobError::Http { kind, .. }
            | JobError::Cancelled { kind } => *kind,
        }
    }

    /// Connection failures and 5xx answers are worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Http { status, .. } => status.map_or(true, |s| s >= 500),
            _ => false,
        }
    }
}

/// Transport for submitting and polling jobs
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submit a job, returning its opaque id
    async fn submit(&self, kind: JobKind, payload: &Value) -> Result<String, JobError>;

    /// Fetch the current status of a submitted job
    async fn fetch(&self, kind: JobKind, job_id: &str) -> Result<JobStatus, JobError>;
}

/// Interpret a status/result body
///
/// A non-null `result` means ready. An explicit `status` of `failed` or
/// `error` is terminal. Anything else is still pending.
pub fn classify_status(body: &Value) -> JobStatus {
    if let Some(result) = body.get("result").filter(|r| !r.is_null()) {
        return JobStatus::Ready(result.clone());
    }

    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    match status.as_deref() {
        Some("failed") | Some("error") => {
            let reason = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("job reported failure")
                .to_string();
            JobStatus::Failed(reason)
        }
        _ => JobStatus::Pending,
    }
}

fn parse_job_id(kind: JobKind, body: &Value) -> Result<String, JobError> {
    match body.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(JobError::Malformed {
            kind,
            detail: format!("submission response has no job id: {}", body),
        }),
    }
}

/// HTTP implementation of [`JobService`]
pub struct HttpJobService {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpJobService {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, kind: JobKind) -> String {
        format!("{}/{}", self.base_url, kind.endpoint())
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn submit(&self, kind: JobKind, payload: &Value) -> Result<String, JobError> {
        let response = self
            .http_client
            .post(self.url(kind))
            .json(payload)
            .send()
            .await
            .map_err(|e| JobError::Http {
                kind,
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(JobError::Http {
                kind,
                status: Some(status.as_u16()),
                detail: error_text,
            });
        }

        let body: Value = response.json().await.map_err(|e| JobError::Malformed {
            kind,
            detail: e.to_string(),
        })?;

        parse_job_id(kind, &body)
    }

    async fn fetch(&self, kind: JobKind, job_id: &str) -> Result<JobStatus, JobError> {
        let response = self
            .http_client
            .get(format!("{}/{}", self.url(kind), job_id))
            .send()
            .await
            .map_err(|e| JobError::Http {
                kind,
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(JobStatus::Pending);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(JobError::Http {
                kind,
                status: Some(status.as_u16()),
                detail: error_text,
            });
        }

        let body: Value = response.json().await.map_err(|e| JobError::Malformed {
            kind,
            detail: e.to_string(),
        })?;

        Ok(classify_status(&body))
    }
}

/// Exponential backoff between polls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Delay following `current`, capped at `max`
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Submit/poll driver shared by every job kind
#[derive(Clone)]
pub struct JobClient {
    service: Arc<dyn JobService>,
    backoff: BackoffPolicy,
    default_timeout: Duration,
    timeouts: HashMap<JobKind, Duration>,
}

impl JobClient {
    pub fn new(service: Arc<dyn JobService>, backoff: BackoffPolicy, default_timeout: Duration) -> Self {
        Self {
            service,
            backoff,
            default_timeout,
            timeouts: HashMap::new(),
        }
    }

    pub fn from_config(service: Arc<dyn JobService>, config: &JobsConfig) -> Self {
        let mut client = Self::new(
            service,
            config.backoff(),
            Duration::from_secs(config.default_timeout_secs),
        );
        for kind in JobKind::ALL {
            client.timeouts.insert(kind, config.timeout_for(kind));
        }
        client
    }

    pub fn with_timeout(mut self, kind: JobKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        self.timeouts.get(&kind).copied().unwrap_or(self.default_timeout)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Submit a job and wait for its result
    ///
    /// Returns the raw `result` payload. The whole exchange (submission
    /// included) is bounded by the kind's timeout and abandoned as soon as
    /// `cancel` fires.
    pub async fn submit_and_await(
        &self,
        kind: JobKind,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, JobError> {
        let timeout = self.timeout_for(kind);
        let start_time = Instant::now();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(kind = %kind, "Job wait cancelled");
                Err(JobError::Cancelled { kind })
            }
            outcome = tokio::time::timeout(timeout, self.drive(kind, &payload)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    let waited_ms = start_time.elapsed().as_millis() as u64;
                    tracing::warn!(kind = %kind, waited_ms, "Job timed out");
                    Err(JobError::Timeout { kind, waited_ms })
                }
            }
        }
    }

    /// [`submit_and_await`](Self::submit_and_await) followed by typed decoding
    pub async fn submit_and_parse<T: DeserializeOwned>(
        &self,
        kind: JobKind,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<T, JobError> {
        let result = self.submit_and_await(kind, payload, cancel).await?;
        serde_json::from_value(result).map_err(|e| JobError::Malformed {
            kind,
            detail: e.to_string(),
        })
    }

    async fn drive(&self, kind: JobKind, payload: &Value) -> Result<Value, JobError> {
        let mut delay = self.backoff.initial;

        let job_id = loop {
            match self.service.submit(kind, payload).await {
                Ok(job_id) => break job_id,
                Err(e) if e.is_transient() => {
                    tracing::warn!(kind = %kind, error = %e, backoff_ms = delay.as_millis() as u64, "Job submission failed, will retry");
                    tokio::time::sleep(delay).await;
                    delay = self.backoff.next(delay);
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(kind = %kind, job_id = %job_id, "Job submitted");
        delay = self.backoff.initial;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.service.fetch(kind, &job_id).await {
                Ok(JobStatus::Ready(result)) => {
                    tracing::debug!(kind = %kind, job_id = %job_id, polls, "Job ready");
                    return Ok(result);
                }
                Ok(JobStatus::Failed(reason)) => {
                    return Err(JobError::Failed { kind, job_id, reason });
                }
                Ok(JobStatus::Pending) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(kind = %kind, job_id = %job_id, error = %e, "Job poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(delay).await;
            delay = self.backoff.next(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports Pending `pending_polls` times, then the scripted final status
    struct ScriptedService {
        pending_polls: usize,
        last: JobStatus,
        polls: AtomicUsize,
    }

    impl ScriptedService {
        fn new(pending_polls: usize, last: JobStatus) -> Arc<Self> {
            Arc::new(Self {
                pending_polls,
                last,
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobService for ScriptedService {
        async fn submit(&self, _kind: JobKind, _payload: &Value) -> Result<String, JobError> {
            Ok("job-1".to_string())
        }

        async fn fetch(&self, _kind: JobKind, _job_id: &str) -> Result<JobStatus, JobError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                Ok(JobStatus::Pending)
            } else {
                Ok(self.last.clone())
            }
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BackoffPolicy::default();
        let mut delay = policy.initial;
        for _ in 0..20 {
            delay = policy.next(delay);
        }
        assert_eq!(delay, policy.max);
        assert_eq!(policy.next(Duration::from_millis(250)), Duration::from_millis(500));
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(&json!({"result": {"a": 1}})), JobStatus::Ready(json!({"a": 1})));
        assert_eq!(classify_status(&json!({"result": null})), JobStatus::Pending);
        assert_eq!(classify_status(&json!({"status": "running"})), JobStatus::Pending);
        assert_eq!(
            classify_status(&json!({"status": "FAILED", "error": "bad file"})),
            JobStatus::Failed("bad file".to_string())
        );
    }

    #[test]
    fn test_parse_job_id_accepts_numbers() {
        assert_eq!(parse_job_id(JobKind::Orbit, &json!({"id": 42})).unwrap(), "42");
        assert!(matches!(
            parse_job_id(JobKind::Orbit, &json!({"job": 1})),
            Err(JobError::Malformed { kind: JobKind::Orbit, .. })
        ));
    }

    #[tokio::test]
    async fn test_polls_until_ready() {
        let service = ScriptedService::new(3, JobStatus::Ready(json!({"ok": true})));
        let client = JobClient::new(service.clone(), fast_backoff(), Duration::from_secs(5));

        let result = client
            .submit_and_await(JobKind::Describe, json!({}), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, json!({"ok": true}));
        assert_eq!(service.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_job_is_terminal() {
        let service = ScriptedService::new(0, JobStatus::Failed("boom".to_string()));
        let client = JobClient::new(service, fast_backoff(), Duration::from_secs(5));

        let err = client
            .submit_and_await(JobKind::Calibrate, json!({}), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            JobError::Failed {
                kind: JobKind::Calibrate,
                job_id: "job-1".to_string(),
                reason: "boom".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_bounds_the_wait() {
        let service = ScriptedService::new(usize::MAX, JobStatus::Pending);
        let client = JobClient::new(service, fast_backoff(), Duration::from_secs(60))
            .with_timeout(JobKind::Orbit, Duration::from_millis(50));

        let err = client
            .submit_and_await(JobKind::Orbit, json!({}), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Timeout { kind: JobKind::Orbit, .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let service = ScriptedService::new(usize::MAX, JobStatus::Pending);
        let client = JobClient::new(service, fast_backoff(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .submit_and_await(JobKind::Ephemeris, json!({}), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, JobError::Cancelled { kind: JobKind::Ephemeris });
    }

    #[tokio::test]
    async fn test_malformed_result_is_reported() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Expected {
            elements: Vec<f64>,
        }

        let service = ScriptedService::new(0, JobStatus::Ready(json!({"elements": "nope"})));
        let client = JobClient::new(service, fast_backoff(), Duration::from_secs(5));

        let err = client
            .submit_and_parse::<Expected>(JobKind::Orbit, json!({}), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Malformed { kind: JobKind::Orbit, .. }));
    }
}
