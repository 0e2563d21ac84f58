//! Concrete platform integrations.

pub mod digitalocean;
pub(crate) mod http;
pub mod tencentcloud;

pub use digitalocean::{DigitalOceanCdn, DigitalOceanCertificates, DigitalOceanClient};
pub use tencentcloud::{TencentCloudCertificates, TencentCloudClient, TencentCloudDeployJobs};
