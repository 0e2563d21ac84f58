use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DeployError;
use crate::executor::{FanOutOptions, JobOptions, JobVariant, PollPolicy};
use crate::resolver::DomainMatchPattern;

fn default_match_pattern() -> String {
    DomainMatchPattern::Exact.to_string()
}

fn default_concurrency() -> usize {
    1
}

/// Per-deployment configuration, read from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub provider: String,
    #[serde(default = "default_match_pattern")]
    pub domain_match_pattern: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub poll_max_attempts: Option<u32>,
    #[serde(default)]
    pub replace_in_place: bool,
    #[serde(default)]
    pub previous_cert_id: Option<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub certificate_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

impl DeployConfig {
    pub fn from_json(raw: &str) -> Result<Self, DeployError> {
        serde_json::from_str(raw)
            .map_err(|err| DeployError::config(format!("invalid deploy config: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            DeployError::config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn match_pattern(&self) -> Result<DomainMatchPattern, DeployError> {
        self.domain_match_pattern.parse()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let mut policy = match self.poll_interval_secs {
            Some(secs) => PollPolicy::fixed(Duration::from_secs(secs)),
            None => PollPolicy::default(),
        };
        if let Some(max_attempts) = self.poll_max_attempts.filter(|max| *max > 0) {
            policy = policy.with_max_attempts(max_attempts);
        }
        policy
    }

    pub fn fan_out_options(&self) -> Result<FanOutOptions, DeployError> {
        Ok(FanOutOptions {
            pattern: self.match_pattern()?,
            domains: self.domains.clone(),
            concurrency: self.concurrency.max(1),
        })
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            variant: if self.replace_in_place {
                JobVariant::ReplaceInPlace
            } else {
                JobVariant::Rebind
            },
            previous_cert_id: self.previous_cert_id.clone(),
            resource_types: self.resource_types.clone(),
            regions: self.regions.clone(),
            instance_ids: self.domains.clone(),
            policy: self.poll_policy(),
        }
    }

    /// Required string credential, e.g. `api_token`.
    pub fn credential(&self, key: &str) -> Result<&str, DeployError> {
        self.credentials
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                DeployError::config(format!(
                    "missing credential '{key}' for provider '{}'",
                    self.provider
                ))
            })
    }
}
