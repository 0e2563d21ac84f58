use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::executor::{DeployResult, Deployer, FanOutDeployer, JobDeployer};
use crate::manager::DedupCertificateManager;
use crate::providers::{
    DigitalOceanCdn, DigitalOceanCertificates, DigitalOceanClient, TencentCloudCertificates,
    TencentCloudClient, TencentCloudDeployJobs,
};

/// Builds a configured deployer for one provider.
pub type DeployerFactory = fn(&DeployConfig) -> Result<Box<dyn Deployer>, DeployError>;

/// Provider name to deployer factory.
pub struct ProviderRegistry {
    factories: BTreeMap<String, DeployerFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("digitalocean-cdn", digitalocean_cdn);
        registry.register("manual", manual);
        registry.register("tencentcloud-ssl", tencentcloud_ssl);
        registry
    }

    pub fn register(&mut self, name: &str, factory: DeployerFactory) {
        self.factories.insert(provider_key(name), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, config: &DeployConfig) -> Result<Box<dyn Deployer>, DeployError> {
        let factory = self
            .factories
            .get(&provider_key(&config.provider))
            .ok_or_else(|| {
                DeployError::config(format!("unknown provider '{}'", config.provider))
            })?;
        log::debug!("[registry] building deployer for {}", config.provider);
        factory(config)
    }
}

fn provider_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn digitalocean_cdn(config: &DeployConfig) -> Result<Box<dyn Deployer>, DeployError> {
    let mut client = DigitalOceanClient::new(config.credential("api_token")?);
    if let Some(base_url) = config.base_url.as_deref().filter(|url| !url.trim().is_empty()) {
        client = client.with_base_url(base_url.trim());
    }

    let mut manager = DedupCertificateManager::new(DigitalOceanCertificates::new(client.clone()));
    if let Some(name) = &config.certificate_name {
        manager = manager.with_name_prefix(name.as_str());
    }
    Ok(Box::new(FanOutDeployer::new(
        manager,
        DigitalOceanCdn::new(client.clone()),
        DigitalOceanCdn::new(client),
        config.fan_out_options()?,
    )))
}

fn tencentcloud_ssl(config: &DeployConfig) -> Result<Box<dyn Deployer>, DeployError> {
    let mut client = TencentCloudClient::new(
        config.credential("secret_id")?,
        config.credential("secret_key")?,
    );
    if let Some(base_url) = config.base_url.as_deref().filter(|url| !url.trim().is_empty()) {
        client = client.with_endpoint(base_url.trim());
    }

    let mut manager = DedupCertificateManager::new(TencentCloudCertificates::new(client.clone()));
    if let Some(name) = &config.certificate_name {
        manager = manager.with_name_prefix(name.as_str());
    }
    Ok(Box::new(JobDeployer::new(
        manager,
        TencentCloudDeployJobs::new(client),
        config.job_options(),
    )))
}

fn manual(config: &DeployConfig) -> Result<Box<dyn Deployer>, DeployError> {
    Ok(Box::new(ManualDeployer {
        provider: config.provider.clone(),
    }))
}

/// Placeholder for platforms where the operator applies the certificate.
struct ManualDeployer {
    provider: String,
}

#[async_trait]
impl Deployer for ManualDeployer {
    async fn deploy(
        &self,
        _cancel: &CancellationToken,
        _cert_pem: &str,
        _key_pem: &str,
    ) -> Result<DeployResult, DeployError> {
        Err(DeployError::NotImplemented(format!(
            "provider '{}' has no automated deployment",
            self.provider
        )))
    }
}
