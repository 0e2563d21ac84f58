use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};

use super::{CertificateCache, DeployResult, Deployer};
use crate::cancel::{CancellationToken, cancellable, ensure_active};
use crate::certificate::Certificate;
use crate::error::{DeployError, PartialFailure, TargetFailure, UpstreamExt};
use crate::manager::{CertificateManager, UploadResult};
use crate::resolver::{DeployTarget, DomainMatchPattern, InventorySource, resolve, validate_configured};

/// Everything a binder needs to attach the uploaded certificate to one target.
pub struct BindRequest<'a> {
    pub target: &'a DeployTarget,
    pub upload: &'a UploadResult,
    pub cert_pem: &'a str,
    pub cache: &'a CertificateCache,
    pub cancel: &'a CancellationToken,
}

/// Platform call sequence that binds a certificate to a single target.
#[async_trait]
pub trait TargetBinder: Send + Sync {
    async fn bind(&self, request: BindRequest<'_>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FanOutOptions {
    pub pattern: DomainMatchPattern,
    pub domains: Vec<String>,
    /// Number of targets bound at the same time; 1 binds sequentially.
    pub concurrency: usize,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            pattern: DomainMatchPattern::Exact,
            domains: Vec::new(),
            concurrency: 1,
        }
    }
}

/// Uploads once, resolves targets and binds each of them, collecting every
/// per-target failure instead of stopping at the first one.
pub struct FanOutDeployer<M, I, B> {
    manager: M,
    inventory: I,
    binder: B,
    options: FanOutOptions,
}

impl<M, I, B> FanOutDeployer<M, I, B>
where
    M: CertificateManager,
    I: InventorySource,
    B: TargetBinder,
{
    pub fn new(manager: M, inventory: I, binder: B, options: FanOutOptions) -> Self {
        Self {
            manager,
            inventory,
            binder,
            options,
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn binder(&self) -> &B {
        &self.binder
    }

    async fn bind_one(
        &self,
        cancel: &CancellationToken,
        target: &DeployTarget,
        upload: &UploadResult,
        cert_pem: &str,
        cache: &CertificateCache,
    ) -> Result<(), DeployError> {
        ensure_active(cancel)?;
        let request = BindRequest {
            target,
            upload,
            cert_pem,
            cache,
            cancel,
        };
        cancellable(cancel, async {
            self.binder.bind(request).await.upstream("bind certificate")
        })
        .await
    }

    async fn bind_all(
        &self,
        cancel: &CancellationToken,
        targets: &[DeployTarget],
        upload: &UploadResult,
        cert_pem: &str,
    ) -> Result<Vec<DeployTarget>, DeployError> {
        if targets.is_empty() {
            info!("[fan-out] no targets to bind, nothing to do");
            return Ok(Vec::new());
        }

        let cache = CertificateCache::new();
        cache.remember(&upload.cert_id, cert_pem);

        let concurrency = self.options.concurrency.max(1);
        let outcomes: Vec<(DeployTarget, Result<(), DeployError>)> =
            futures::stream::iter(targets.iter().cloned())
                .map(|target| {
                    let cache = &cache;
                    async move {
                        let outcome = self.bind_one(cancel, &target, upload, cert_pem, cache).await;
                        (target, outcome)
                    }
                })
                .buffered(concurrency)
                .collect()
                .await;

        let attempted = outcomes.len();
        let mut bound = Vec::new();
        let mut failures = Vec::new();
        for (target, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    info!("[fan-out] bound {} to {target}", upload.cert_id);
                    bound.push(target);
                }
                Err(err) => {
                    warn!("[fan-out] binding {target} failed: {err}");
                    failures.push(TargetFailure {
                        target: target.to_string(),
                        error: err,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Ok(bound);
        }
        // Applied binds stay applied. Real failures are never folded into
        // `Cancelled`; the partial failure reports them with the skipped targets.
        if failures.iter().all(|failure| failure.error.is_cancelled()) {
            info!(
                "[fan-out] cancelled after binding {} of {attempted} target(s)",
                bound.len()
            );
            return Err(DeployError::Cancelled);
        }
        Err(DeployError::PartialFailure(PartialFailure {
            attempted,
            failures,
        }))
    }
}

#[async_trait]
impl<M, I, B> Deployer for FanOutDeployer<M, I, B>
where
    M: CertificateManager,
    I: InventorySource,
    B: TargetBinder,
{
    async fn deploy(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<DeployResult, DeployError> {
        let certificate = Certificate::parse(cert_pem)?;
        validate_configured(self.options.pattern, &self.options.domains)?;
        ensure_active(cancel)?;

        let upload = self.manager.upload(cancel, cert_pem, key_pem).await?;
        let targets = resolve(
            cancel,
            self.options.pattern,
            &self.options.domains,
            &certificate,
            &self.inventory,
        )
        .await?;
        let bound = self.bind_all(cancel, &targets, &upload, cert_pem).await?;

        Ok(DeployResult {
            upload,
            targets: bound,
            job: None,
        })
    }
}
