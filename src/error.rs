use std::fmt;

use thiserror::Error;

/// Errors surfaced by the deployment engine.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("certificate parse failed: {0}")]
    Parse(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("{operation} failed: {message}")]
    Upstream { operation: String, message: String },
    #[error(transparent)]
    PartialFailure(PartialFailure),
    #[error(
        "deployment job {job_id} finished with failures (succeeded: {succeeded}, failed: {failed}, total: {total})"
    )]
    JobFailed {
        job_id: String,
        succeeded: u64,
        failed: u64,
        total: u64,
    },
    #[error("deployment job {job_id} not finished after {attempts} poll(s)")]
    JobIncomplete { job_id: String, attempts: u32 },
    #[error("deployment cancelled")]
    Cancelled,
}

impl DeployError {
    pub fn config(message: impl Into<String>) -> Self {
        DeployError::Config(message.into())
    }

    /// Wraps a platform error, naming the operation that failed.
    ///
    /// Cancellation that surfaced through a platform seam stays `Cancelled`.
    pub fn upstream(operation: &str, err: anyhow::Error) -> Self {
        if let Some(DeployError::Cancelled) = err.downcast_ref::<DeployError>() {
            return DeployError::Cancelled;
        }
        DeployError::Upstream {
            operation: operation.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// True for `Cancelled` and for a sweep that was cut short by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            DeployError::Cancelled => true,
            DeployError::PartialFailure(partial) => partial.was_cancelled(),
            _ => false,
        }
    }
}

/// Converts seam results into `DeployError::Upstream` annotated with the operation name.
pub trait UpstreamExt<T> {
    fn upstream(self, operation: &str) -> Result<T, DeployError>;
}

impl<T> UpstreamExt<T> for anyhow::Result<T> {
    fn upstream(self, operation: &str) -> Result<T, DeployError> {
        self.map_err(|err| DeployError::upstream(operation, err))
    }
}

/// One failed target from a fan-out sweep.
#[derive(Debug)]
pub struct TargetFailure {
    pub target: String,
    pub error: DeployError,
}

/// Every per-target failure of a fan-out sweep, joined into a single error.
#[derive(Debug)]
pub struct PartialFailure {
    pub attempted: usize,
    pub failures: Vec<TargetFailure>,
}

impl PartialFailure {
    pub fn failed_targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }

    /// Targets skipped or interrupted because the deployment was cancelled.
    pub fn cancelled_targets(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter(|f| f.error.is_cancelled())
            .map(|f| f.target.as_str())
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_cancelled())
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} target(s) failed",
            self.failures.len(),
            self.attempted
        )?;
        for failure in &self.failures {
            write!(f, "; [{}] {}", failure.target, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}
