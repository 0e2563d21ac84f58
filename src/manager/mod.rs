use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cancel::CancellationToken;
use crate::certificate::Certificate;
use crate::error::DeployError;
use crate::paging::{DEFAULT_PAGE_SIZE, PageRequest};

mod dedup;

pub use dedup::DedupCertificateManager;

/// Identity of a certificate in a platform's certificate store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub cert_id: String,
    pub cert_name: Option<String>,
    #[serde(default)]
    pub extended_data: Map<String, Value>,
}

/// Outcome of an in-place replacement; `cert_id` is the preserved identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperateResult {
    pub cert_id: String,
    #[serde(default)]
    pub extended_data: Map<String, Value>,
}

/// Per-platform certificate store contract.
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Uploads the certificate unless an equivalent one already exists, in
    /// which case the existing identity is returned and nothing is written.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<UploadResult, DeployError>;

    /// Replaces the content behind an existing identity.
    async fn replace(
        &self,
        _cancel: &CancellationToken,
        cert_id_or_name: &str,
        _cert_pem: &str,
        _key_pem: &str,
    ) -> Result<OperateResult, DeployError> {
        Err(DeployError::Unsupported(format!(
            "in-place replacement of certificate '{cert_id_or_name}'"
        )))
    }
}

/// Certificate as listed by a platform. Fields the platform does not
/// report are `None`.
#[derive(Debug, Clone, Default)]
pub struct StoredCertificate {
    pub id: String,
    pub name: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub fingerprint_sha1: Option<Vec<u8>>,
    pub fingerprint_sha256: Option<Vec<u8>>,
    pub extended_data: Map<String, Value>,
}

/// Certificate material handed to a platform's create or replace call.
pub struct NewCertificate<'a> {
    pub name: String,
    pub certificate_pem: &'a str,
    pub private_key_pem: &'a str,
    pub certificate: &'a Certificate,
}

/// Low-level certificate store calls every platform integration provides.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Platform label used in log lines and error messages.
    fn platform(&self) -> &str;

    fn page_size(&self) -> u32 {
        DEFAULT_PAGE_SIZE
    }

    async fn list_certificates(&self, page: PageRequest) -> anyhow::Result<Vec<StoredCertificate>>;

    /// Full PEM text of a stored certificate, when the platform exposes it.
    async fn fetch_certificate_pem(&self, _id: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn create_certificate(&self, request: &NewCertificate<'_>) -> anyhow::Result<UploadResult>;

    /// Some platforms reject a duplicate upload with an error that names the
    /// existing certificate. Returning its id turns the failure into a dedup hit.
    fn existing_id_from_create_error(&self, _err: &anyhow::Error) -> Option<String> {
        None
    }

    fn supports_replace(&self) -> bool {
        false
    }

    async fn replace_certificate(
        &self,
        id: &str,
        _request: &NewCertificate<'_>,
    ) -> anyhow::Result<OperateResult> {
        Err(anyhow::anyhow!(
            "{} cannot replace certificate {id}",
            self.platform()
        ))
    }
}
