//! Cancellation helpers shared by every loop and remote call in a deployment.
//!
//! A deployment is driven by a single `CancellationToken`. Loops check it on
//! every iteration and remote calls race against it, so cancelling leaves the
//! platform in whatever state the already-finished calls produced.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::error::DeployError;

/// Fails with `Cancelled` once the token has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<(), DeployError> {
    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
    }
    Ok(())
}

/// Runs `fut` unless the token fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, DeployError>
where
    F: Future<Output = Result<T, DeployError>>,
{
    ensure_active(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeployError::Cancelled),
        result = fut => result,
    }
}

/// Sleeps for `interval`, waking early with `Cancelled` if the token fires.
pub async fn sleep(cancel: &CancellationToken, interval: Duration) -> Result<(), DeployError> {
    if interval.is_zero() {
        return ensure_active(cancel);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeployError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
