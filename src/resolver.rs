//! Resolution of the concrete targets a certificate has to be bound to.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::certificate::Certificate;
use crate::domain::{canonical_host, is_wildcard_match, is_wildcard_pattern};
use crate::error::{DeployError, UpstreamExt};
use crate::paging::{DEFAULT_PAGE_SIZE, PageRequest, pages};

/// How configured domains are turned into deployment targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainMatchPattern {
    /// Configured values are the targets.
    #[default]
    Exact,
    /// `*.` values select every inventory domain one label below them.
    Wildcard,
    /// Every inventory domain the certificate is valid for.
    CertSan,
}

impl FromStr for DomainMatchPattern {
    type Err = DeployError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "wildcard" => Ok(Self::Wildcard),
            "certsan" | "cert_san" | "cert-san" => Ok(Self::CertSan),
            _ => Err(DeployError::config(format!(
                "unsupported domain match pattern '{raw}'"
            ))),
        }
    }
}

impl fmt::Display for DomainMatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exact => "exact",
            Self::Wildcard => "wildcard",
            Self::CertSan => "certsan",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetKind {
    #[default]
    Domain,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployTarget {
    Domain(String),
    ResourceId(String),
}

impl DeployTarget {
    pub fn new(kind: TargetKind, value: impl Into<String>) -> Self {
        match kind {
            TargetKind::Domain => Self::Domain(value.into()),
            TargetKind::Resource => Self::ResourceId(value.into()),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Domain(value) | Self::ResourceId(value) => value,
        }
    }

    fn dedup_key(&self) -> String {
        match self {
            Self::Domain(domain) => canonical_host(domain),
            Self::ResourceId(id) => id.clone(),
        }
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

/// Paginated listing of the domains (or resource ids) a platform can bind.
#[async_trait]
pub trait InventorySource: Send + Sync {
    fn target_kind(&self) -> TargetKind {
        TargetKind::Domain
    }

    fn page_size(&self) -> u32 {
        DEFAULT_PAGE_SIZE
    }

    /// One entry per inventory item. Items without a bindable domain are
    /// returned as empty strings so that the page keeps its length.
    async fn list_domains(&self, page: PageRequest) -> anyhow::Result<Vec<String>>;
}

/// Ordered, de-duplicated target list.
#[derive(Default)]
struct TargetSet {
    seen: HashSet<String>,
    targets: Vec<DeployTarget>,
}

impl TargetSet {
    fn insert(&mut self, target: DeployTarget) -> bool {
        if self.seen.insert(target.dedup_key()) {
            self.targets.push(target);
            true
        } else {
            false
        }
    }
}

fn non_empty(configured: &[String]) -> Vec<&str> {
    configured
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect()
}

/// Checks the configured domains `pattern` needs, without any remote call.
pub fn validate_configured(
    pattern: DomainMatchPattern,
    configured: &[String],
) -> Result<(), DeployError> {
    match pattern {
        DomainMatchPattern::Exact | DomainMatchPattern::Wildcard
            if non_empty(configured).is_empty() =>
        {
            Err(DeployError::config(format!(
                "at least one domain is required for {pattern} matching"
            )))
        }
        _ => Ok(()),
    }
}

/// Computes the targets for `pattern`.
///
/// Output order is first appearance: configured order, then inventory order.
pub async fn resolve(
    cancel: &CancellationToken,
    pattern: DomainMatchPattern,
    configured: &[String],
    certificate: &Certificate,
    inventory: &dyn InventorySource,
) -> Result<Vec<DeployTarget>, DeployError> {
    validate_configured(pattern, configured)?;
    let kind = inventory.target_kind();
    let configured = non_empty(configured);
    let mut set = TargetSet::default();

    match pattern {
        DomainMatchPattern::Exact => {
            for value in configured {
                set.insert(DeployTarget::new(kind, value));
            }
        }
        DomainMatchPattern::Wildcard => {
            for value in configured {
                if !is_wildcard_pattern(value) {
                    set.insert(DeployTarget::new(kind, value));
                    continue;
                }
                let matched = scan(cancel, inventory, |candidate| {
                    is_wildcard_match(value, candidate)
                })
                .await?;
                if matched.is_empty() {
                    return Err(DeployError::config(format!(
                        "no inventory domain matches '{value}'"
                    )));
                }
                for candidate in matched {
                    set.insert(DeployTarget::new(kind, candidate));
                }
            }
        }
        DomainMatchPattern::CertSan => {
            let matched = scan(cancel, inventory, |candidate| {
                certificate.verifies_hostname(candidate)
            })
            .await?;
            if matched.is_empty() {
                return Err(DeployError::config(
                    "no inventory domain is covered by the certificate",
                ));
            }
            for candidate in matched {
                set.insert(DeployTarget::new(kind, candidate));
            }
        }
    }

    info!(
        "[resolver] pattern={pattern} resolved {} target(s)",
        set.targets.len()
    );
    Ok(set.targets)
}

async fn scan<F>(
    cancel: &CancellationToken,
    inventory: &dyn InventorySource,
    mut keep: F,
) -> Result<Vec<String>, DeployError>
where
    F: FnMut(&str) -> bool,
{
    let stream = pages(cancel, inventory.page_size(), move |request| async move {
        inventory.list_domains(request).await.upstream("list inventory")
    });
    futures::pin_mut!(stream);

    let mut matched = Vec::new();
    while let Some(page) = stream.try_next().await? {
        for candidate in page {
            if candidate.trim().is_empty() {
                continue;
            }
            if keep(&candidate) {
                debug!("[resolver] keeping {candidate}");
                matched.push(candidate);
            }
        }
    }
    Ok(matched)
}
