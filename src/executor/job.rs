use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;

use super::{DeployResult, Deployer};
use crate::cancel::{CancellationToken, cancellable, ensure_active};
use crate::certificate::Certificate;
use crate::error::{DeployError, UpstreamExt};
use crate::manager::CertificateManager;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed-interval polling schedule for asynchronous deployment jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: None,
        }
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Polls back to back; meant for tests.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}

/// Progress counters of a job, or of one shard of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total: u64,
}

impl JobCounters {
    /// Adds up the per-resource-type shards of one logical job. Returns
    /// `None` when a counter overflows.
    pub fn sum<'a>(shards: impl IntoIterator<Item = &'a JobCounters>) -> Option<Self> {
        shards.into_iter().try_fold(Self::default(), |acc, shard| {
            Some(Self {
                pending: acc.pending.checked_add(shard.pending)?,
                running: acc.running.checked_add(shard.running)?,
                succeeded: acc.succeeded.checked_add(shard.succeeded)?,
                failed: acc.failed.checked_add(shard.failed)?,
                total: acc.total.checked_add(shard.total)?,
            })
        })
    }

    fn finished(&self) -> u64 {
        self.succeeded.saturating_add(self.failed)
    }

    /// Finished once every resource succeeded or failed. A platform that
    /// reports more finished resources than its total is finished too.
    pub fn is_terminal(&self) -> bool {
        self.finished() >= self.total
    }

    fn is_consistent(&self) -> bool {
        self.pending
            .checked_add(self.running)
            .and_then(|sum| sum.checked_add(self.succeeded))
            .and_then(|sum| sum.checked_add(self.failed))
            == Some(self.total)
    }

    fn regressed_from(&self, previous: &JobCounters) -> bool {
        self.succeeded < previous.succeeded || self.failed < previous.failed
    }
}

/// Lifecycle of a deployment job. Variants are ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Client-side view of one submitted job, alive for a single deployment.
#[derive(Debug, Clone)]
pub struct DeploymentJob {
    job_id: String,
    state: JobState,
    counters: Option<JobCounters>,
    polls: u32,
}

impl DeploymentJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Submitted,
            counters: None,
            polls: 0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn counters(&self) -> Option<JobCounters> {
        self.counters
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Records an observation and returns the resulting state.
    ///
    /// A terminal job ignores further observations and a non-terminal state
    /// never moves backwards.
    pub fn observe(&mut self, counters: JobCounters) -> JobState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.polls += 1;
        if !counters.is_consistent() {
            warn!(
                "[job] {} counters do not add up: {counters:?}",
                self.job_id
            );
        }
        if let Some(previous) = &self.counters {
            if counters.regressed_from(previous) {
                warn!(
                    "[job] {} counters went backwards: {previous:?} -> {counters:?}",
                    self.job_id
                );
            }
        }
        self.counters = Some(counters);

        let observed = if counters.is_terminal() {
            if counters.failed > 0 {
                JobState::Failed
            } else {
                JobState::Succeeded
            }
        } else if counters.running > 0 {
            JobState::Running
        } else {
            JobState::Pending
        };
        if observed.is_terminal() || observed > self.state {
            self.state = observed;
        }
        self.state
    }

    pub fn summary(&self) -> JobSummary {
        let counters = self.counters.unwrap_or_default();
        JobSummary {
            job_id: self.job_id.clone(),
            state: self.state,
            succeeded: counters.succeeded,
            failed: counters.failed,
            total: counters.total,
            polls: self.polls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub state: JobState,
    pub succeeded: u64,
    pub failed: u64,
    pub total: u64,
    pub polls: u32,
}

/// Which submit/status pair of the platform a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobVariant {
    /// Swap the certificate behind bindings of an existing identity.
    ReplaceInPlace,
    /// Bind the new identity to every selected resource.
    Rebind,
}

pub struct JobSubmission<'a> {
    pub variant: JobVariant,
    pub previous_cert_id: Option<&'a str>,
    pub cert_id: &'a str,
    pub resource_types: &'a [String],
    pub regions: &'a [String],
    /// Platform resource ids to bind; used by `Rebind`.
    pub instance_ids: &'a [String],
}

/// Platform calls of the asynchronous job shape.
#[async_trait]
pub trait JobPlatform: Send + Sync {
    async fn submit_job(&self, submission: &JobSubmission<'_>) -> anyhow::Result<String>;

    /// Current counters of the job, one entry per shard.
    async fn job_status(&self, variant: JobVariant, job_id: &str)
    -> anyhow::Result<Vec<JobCounters>>;
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub variant: JobVariant,
    pub previous_cert_id: Option<String>,
    pub resource_types: Vec<String>,
    pub regions: Vec<String>,
    pub instance_ids: Vec<String>,
    pub policy: PollPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            variant: JobVariant::Rebind,
            previous_cert_id: None,
            resource_types: Vec::new(),
            regions: Vec::new(),
            instance_ids: Vec::new(),
            policy: PollPolicy::default(),
        }
    }
}

/// Uploads once, submits a platform-side deployment job and polls it to a
/// terminal state.
pub struct JobDeployer<M, P> {
    manager: M,
    platform: P,
    options: JobOptions,
}

impl<M, P> JobDeployer<M, P>
where
    M: CertificateManager,
    P: JobPlatform,
{
    pub fn new(manager: M, platform: P, options: JobOptions) -> Self {
        Self {
            manager,
            platform,
            options,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn previous_cert_id(&self) -> Result<Option<&str>, DeployError> {
        let previous = self
            .options
            .previous_cert_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        match (self.options.variant, previous) {
            (JobVariant::ReplaceInPlace, None) => Err(DeployError::config(
                "previous certificate id is required to replace in place",
            )),
            (_, previous) => Ok(previous),
        }
    }

    async fn wait(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> Result<JobSummary, DeployError> {
        let policy = self.options.policy;
        let variant = self.options.variant;
        let mut job = DeploymentJob::new(job_id);

        loop {
            if policy.exhausted(job.polls()) {
                return Err(DeployError::JobIncomplete {
                    job_id: job_id.to_string(),
                    attempts: job.polls(),
                });
            }
            crate::cancel::sleep(cancel, policy.interval).await?;

            let shards = cancellable(cancel, async {
                self.platform
                    .job_status(variant, job_id)
                    .await
                    .upstream("get deployment job status")
            })
            .await?;
            let counters = JobCounters::sum(&shards).ok_or_else(|| DeployError::Upstream {
                operation: "get deployment job status".to_string(),
                message: format!("job {job_id} reported counters that overflow"),
            })?;

            match job.observe(counters) {
                JobState::Succeeded => {
                    info!(
                        "[job] {job_id} succeeded ({} of {} resource(s))",
                        counters.succeeded, counters.total
                    );
                    return Ok(job.summary());
                }
                JobState::Failed => {
                    return Err(DeployError::JobFailed {
                        job_id: job_id.to_string(),
                        succeeded: counters.succeeded,
                        failed: counters.failed,
                        total: counters.total,
                    });
                }
                state => {
                    debug!(
                        "[job] {job_id} {state:?} (pending: {}, running: {}, succeeded: {}, failed: {}, total: {}), next check in {}s",
                        counters.pending,
                        counters.running,
                        counters.succeeded,
                        counters.failed,
                        counters.total,
                        policy.interval.as_secs()
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<M, P> Deployer for JobDeployer<M, P>
where
    M: CertificateManager,
    P: JobPlatform,
{
    async fn deploy(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<DeployResult, DeployError> {
        Certificate::parse(cert_pem)?;
        let previous_cert_id = self.previous_cert_id()?;
        ensure_active(cancel)?;

        let upload = self.manager.upload(cancel, cert_pem, key_pem).await?;
        let submission = JobSubmission {
            variant: self.options.variant,
            previous_cert_id,
            cert_id: &upload.cert_id,
            resource_types: &self.options.resource_types,
            regions: &self.options.regions,
            instance_ids: &self.options.instance_ids,
        };
        let job_id = cancellable(cancel, async {
            self.platform
                .submit_job(&submission)
                .await
                .upstream("submit deployment job")
        })
        .await?;
        info!(
            "[job] submitted {job_id} ({:?}) for certificate {}",
            submission.variant, upload.cert_id
        );

        let summary = self.wait(cancel, &job_id).await?;
        Ok(DeployResult {
            upload,
            targets: Vec::new(),
            job: Some(summary),
        })
    }
}
