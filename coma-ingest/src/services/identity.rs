//! Identity resolution
//!
//! Files from packed-designation sources carry their catalogue name in the
//! header and are decoded locally. Everything else goes to the external
//! identification job. Identity is never given a fallback value.

use crate::designation::{self, CanonicalDesignation};
use crate::error::StageFailure;
use crate::models::Description;
use crate::services::job_client::JobError;
use crate::services::sci_jobs::{IdentifyRequest, ScienceJobs};
use std::path::{Component, Path};
use tokio_util::sync::CancellationToken;

/// How a file's identity will be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Packed,
    Service,
}

pub struct IdentityResolver {
    jobs: ScienceJobs,
    packed_sources: Vec<String>,
    retries: u32,
}

impl IdentityResolver {
    /// `retries` is the number of extra identification attempts after a
    /// service failure (0 dead-letters on the first failure)
    pub fn new(jobs: ScienceJobs, packed_sources: Vec<String>, retries: u32) -> Self {
        Self {
            jobs,
            packed_sources,
            retries,
        }
    }

    /// Decide the branch from the staged path alone
    pub fn source_of(&self, staged: &Path) -> IdentitySource {
        let packed = staged.components().any(|component| match component {
            Component::Normal(name) => self
                .packed_sources
                .iter()
                .any(|marker| name.to_str() == Some(marker.as_str())),
            _ => false,
        });

        if packed {
            IdentitySource::Packed
        } else {
            IdentitySource::Service
        }
    }

    pub async fn resolve_identity(
        &self,
        staged: &Path,
        description: &Description,
        cancel: &CancellationToken,
    ) -> Result<CanonicalDesignation, StageFailure> {
        let raw_object = description
            .raw_object
            .as_deref()
            .ok_or_else(|| StageFailure::Validation("object name missing from header".to_string()))?;

        match self.source_of(staged) {
            IdentitySource::Packed => {
                let decoded = designation::decode(raw_object)?;
                tracing::debug!(raw = raw_object, designation = %decoded, "Decoded packed designation");
                Ok(decoded)
            }
            IdentitySource::Service => {
                let request = identify_request(raw_object, description)?;
                self.identify_with_retries(&request, cancel).await
            }
        }
    }

    async fn identify_with_retries(
        &self,
        request: &IdentifyRequest,
        cancel: &CancellationToken,
    ) -> Result<CanonicalDesignation, StageFailure> {
        let backoff = self.jobs.client().backoff();
        let mut delay = backoff.initial;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.jobs.identify(request, cancel).await {
                Ok(identity) => return Ok(identity),
                Err(e @ JobError::Cancelled { .. }) => return Err(e.into()),
                Err(e) if attempt <= self.retries => {
                    tracing::warn!(
                        object = %request.object,
                        attempt,
                        error = %e,
                        "Identification failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn identify_request(raw_object: &str, description: &Description) -> Result<IdentifyRequest, StageFailure> {
    let missing = |key: &str| StageFailure::Validation(format!("identification input {} missing", key));

    Ok(IdentifyRequest {
        object: raw_object.to_string(),
        mjd: description.mjd_mid.ok_or_else(|| missing("MJD-MID"))?,
        ra: description.ra.ok_or_else(|| missing("RA-J2000-APPROX"))?,
        dec: description.dec.ok_or_else(|| missing("DEC-J2000-APPROX"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrbitConfig, PhotometryConfig};
    use crate::services::job_client::{BackoffPolicy, JobClient, JobKind, JobService, JobStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Fails the first `failures` identifications, then answers a name
    struct FlakyIdentify {
        failures: usize,
        submissions: AtomicUsize,
    }

    #[async_trait]
    impl JobService for FlakyIdentify {
        async fn submit(&self, _kind: JobKind, _payload: &Value) -> Result<String, JobError> {
            let n = self.submissions.fetch_add(1, Ordering::SeqCst);
            Ok(n.to_string())
        }

        async fn fetch(&self, _kind: JobKind, job_id: &str) -> Result<JobStatus, JobError> {
            let n: usize = job_id.parse().unwrap_or(0);
            if n < self.failures {
                Ok(JobStatus::Failed("no match".to_string()))
            } else {
                Ok(JobStatus::Ready(json!("C/2020 A01")))
            }
        }
    }

    fn resolver(failures: usize, retries: u32) -> (IdentityResolver, Arc<FlakyIdentify>) {
        let service = Arc::new(FlakyIdentify {
            failures,
            submissions: AtomicUsize::new(0),
        });
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            multiplier: 2.0,
        };
        let client = JobClient::new(service.clone(), backoff, Duration::from_secs(5));
        let jobs = ScienceJobs::new(client, PhotometryConfig::default(), OrbitConfig::default());
        (
            IdentityResolver::new(jobs, vec!["packed".to_string()], retries),
            service,
        )
    }

    fn header(raw: &str) -> Description {
        Description {
            raw_object: Some(raw.to_string()),
            mjd_mid: Some(59000.25),
            ra: Some(10.0),
            dec: Some(-5.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_branch_follows_path_component() {
        let (resolver, _) = resolver(0, 0);
        assert_eq!(
            resolver.source_of(&PathBuf::from("/data/staging/atlas/packed/night1/a.fz")),
            IdentitySource::Packed
        );
        assert_eq!(
            resolver.source_of(&PathBuf::from("/data/staging/atlas/unpacked/a.fz")),
            IdentitySource::Service
        );
        assert_eq!(
            resolver.source_of(&PathBuf::from("/data/staging/atlas/packed.fz")),
            IdentitySource::Service
        );
    }

    #[tokio::test]
    async fn test_packed_source_decodes_locally() {
        let (resolver, service) = resolver(0, 0);
        let identity = resolver
            .resolve_identity(Path::new("/staging/packed/a.fz"), &header("PJ95A01B"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identity.as_str(), "P/1995 A01-B");
        assert_eq!(service.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_packed_name_is_decode_failure() {
        let (resolver, _) = resolver(0, 0);
        let err = resolver
            .resolve_identity(Path::new("/staging/packed/a.fz"), &header("ZZ99??"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageFailure::Decode(_)));
    }

    #[tokio::test]
    async fn test_service_failure_dead_letters_without_retries() {
        let (resolver, service) = resolver(1, 0);
        let err = resolver
            .resolve_identity(Path::new("/staging/a.fz"), &header("comet"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StageFailure::ExternalService(JobError::Failed { .. })));
        assert_eq!(service.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configured_retries_recover() {
        let (resolver, service) = resolver(2, 2);
        let identity = resolver
            .resolve_identity(Path::new("/staging/a.fz"), &header("comet"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identity.as_str(), "C/2020 A01");
        assert_eq!(service.submissions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_inputs_are_validation_failures() {
        let (resolver, _) = resolver(0, 0);
        let mut description = header("comet");
        description.ra = None;

        let err = resolver
            .resolve_identity(Path::new("/staging/a.fz"), &description, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageFailure::Validation(reason) if reason.contains("RA-J2000-APPROX")));

        let err = resolver
            .resolve_identity(Path::new("/staging/a.fz"), &Description::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageFailure::Validation(_)));
    }
}
