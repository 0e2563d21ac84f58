//! Certificate deployment engine.
//!
//! A [`Deployer`] uploads a certificate to a platform's certificate store
//! without creating duplicates, resolves the targets it must be bound to and
//! either binds each one ([`FanOutDeployer`]) or drives a platform-side
//! deployment job to completion ([`JobDeployer`]).

pub mod cancel;
pub mod certificate;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod manager;
pub mod paging;
pub mod providers;
pub mod registry;
pub mod resolver;

pub use cancel::CancellationToken;
pub use certificate::{Certificate, FingerprintAlgorithm, SubjectAltName};
pub use config::DeployConfig;
pub use error::{DeployError, PartialFailure, TargetFailure};
pub use executor::{
    BindRequest, CertificateCache, DeployResult, Deployer, FanOutDeployer, FanOutOptions,
    JobCounters, JobDeployer, JobOptions, JobPlatform, JobState, JobSubmission, JobSummary,
    JobVariant, PollPolicy, TargetBinder,
};
pub use manager::{
    CertificateManager, CertificateStore, DedupCertificateManager, NewCertificate, OperateResult,
    StoredCertificate, UploadResult,
};
pub use registry::ProviderRegistry;
pub use resolver::{DeployTarget, DomainMatchPattern, InventorySource, TargetKind};

/// Routes the engine's diagnostics to `logger`.
///
/// Diagnostics go through the `log` facade, so this installs a process-wide
/// logger and fails if one is already set.
pub fn set_logger(logger: Box<dyn log::Log>, level: log::LevelFilter) -> Result<(), DeployError> {
    log::set_boxed_logger(logger)
        .map_err(|err| DeployError::config(format!("logger already installed: {err}")))?;
    log::set_max_level(level);
    Ok(())
}
