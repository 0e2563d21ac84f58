use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::certificate::content_equals;
use crate::error::DeployError;
use crate::manager::UploadResult;
use crate::resolver::DeployTarget;

mod fanout;
mod job;

pub use fanout::{BindRequest, FanOutDeployer, FanOutOptions, TargetBinder};
pub use job::{
    DeploymentJob, JobCounters, JobDeployer, JobOptions, JobPlatform, JobState, JobSubmission,
    JobSummary, JobVariant, PollPolicy,
};

/// Outcome of a successful deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub upload: UploadResult,
    /// Targets bound by the fan-out shape; empty for job-based deployments.
    pub targets: Vec<DeployTarget>,
    pub job: Option<JobSummary>,
}

/// Single entry point of a configured platform integration.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<DeployResult, DeployError>;
}

/// Certificate id to PEM map shared by the binds of one deployment.
///
/// Created inside each `deploy` call and dropped with it.
#[derive(Clone, Default)]
pub struct CertificateCache {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remember(&self, cert_id: &str, pem: &str) {
        self.entries().insert(cert_id.to_string(), pem.to_string());
    }

    /// Whether `cert_id` is known to carry the same content as `pem`.
    /// Unknown ids are treated as stale.
    pub fn is_current(&self, cert_id: &str, pem: &str) -> bool {
        self.entries()
            .get(cert_id)
            .is_some_and(|cached| content_equals(cached, pem))
    }
}
