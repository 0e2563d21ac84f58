use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::{debug, info};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::http;
use crate::cancel::CancellationToken;
use crate::certificate::split_leaf_and_chain;
use crate::domain::canonical_host;
use crate::error::UpstreamExt;
use crate::executor::{BindRequest, TargetBinder};
use crate::manager::{CertificateStore, NewCertificate, StoredCertificate, UploadResult};
use crate::paging::{DEFAULT_PAGE_SIZE, PageRequest, pages};
use crate::resolver::InventorySource;

const PLATFORM: &str = "DigitalOcean";
pub const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com";

/// Authenticated access to the DigitalOcean v2 API.
#[derive(Debug, Clone)]
pub struct DigitalOceanClient {
    api_token: String,
    base_url: String,
    page_size: u32,
}

#[derive(Deserialize)]
struct DigitalOceanCertificateListResponse {
    #[serde(default)]
    certificates: Vec<DigitalOceanCertificate>,
}

#[derive(Deserialize)]
struct DigitalOceanCertificateResponse {
    certificate: DigitalOceanCertificate,
}

#[derive(Deserialize)]
struct DigitalOceanCertificate {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    not_after: Option<String>,
    #[serde(default)]
    sha1_fingerprint: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "type")]
    certificate_type: Option<String>,
    #[serde(default)]
    dns_names: Vec<String>,
}

#[derive(Serialize)]
struct DigitalOceanCreateCertificate<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    certificate_type: &'static str,
    private_key: &'a str,
    leaf_certificate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    certificate_chain: String,
}

#[derive(Deserialize)]
struct DigitalOceanEndpointListResponse {
    #[serde(default)]
    endpoints: Vec<DigitalOceanCdnEndpoint>,
}

#[derive(Deserialize)]
struct DigitalOceanEndpointResponse {
    endpoint: DigitalOceanCdnEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
struct DigitalOceanCdnEndpoint {
    id: String,
    #[serde(default)]
    certificate_id: Option<String>,
    #[serde(default)]
    custom_domain: Option<String>,
}

#[derive(Serialize)]
struct DigitalOceanEndpointUpdate<'a> {
    certificate_id: &'a str,
    custom_domain: &'a str,
}

impl DigitalOceanCertificate {
    fn into_stored(self) -> StoredCertificate {
        let not_after = self.not_after.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|parsed| parsed.with_timezone(&Utc))
                .ok()
        });
        let fingerprint_sha1 = self
            .sha1_fingerprint
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| hex::decode(raw.replace(':', "")).ok());

        let mut extended_data = Map::new();
        if let Some(state) = self.state {
            extended_data.insert("state".into(), Value::String(state));
        }
        if let Some(certificate_type) = self.certificate_type {
            extended_data.insert("type".into(), Value::String(certificate_type));
        }
        if !self.dns_names.is_empty() {
            extended_data.insert(
                "dns_names".into(),
                Value::Array(self.dns_names.into_iter().map(Value::String).collect()),
            );
        }

        StoredCertificate {
            id: self.id,
            name: self.name,
            not_before: None,
            not_after,
            fingerprint_sha1,
            fingerprint_sha256: None,
            extended_data,
        }
    }
}

impl DigitalOceanClient {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        http::HttpClient::shared()
            .request(method, format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_token))
    }

    async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http::status_error(PLATFORM, status, Some(body)));
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {PLATFORM} {what} response"))
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, page: PageRequest, what: &str) -> Result<T> {
        debug!(
            "[do-http] GET {path} page={} per_page={}",
            page.page, page.page_size
        );
        let response = self
            .request(Method::GET, path)
            .query(&[("page", page.page), ("per_page", page.page_size)])
            .send()
            .await
            .with_context(|| format!("Failed to list {PLATFORM} {what}"))?;
        Self::read_json(response, what).await
    }

    async fn list_certificates(&self, page: PageRequest) -> Result<Vec<DigitalOceanCertificate>> {
        let listed: DigitalOceanCertificateListResponse =
            self.list("/v2/certificates", page, "certificates").await?;
        Ok(listed.certificates)
    }

    async fn create_certificate(
        &self,
        body: &DigitalOceanCreateCertificate<'_>,
    ) -> Result<DigitalOceanCertificate> {
        debug!("[do-http] POST /v2/certificates name={}", body.name);
        let response = self
            .request(Method::POST, "/v2/certificates")
            .json(body)
            .send()
            .await
            .context("Failed to create DigitalOcean certificate")?;
        let created: DigitalOceanCertificateResponse =
            Self::read_json(response, "certificate").await?;
        Ok(created.certificate)
    }

    async fn list_endpoints(&self, page: PageRequest) -> Result<Vec<DigitalOceanCdnEndpoint>> {
        let listed: DigitalOceanEndpointListResponse =
            self.list("/v2/cdn/endpoints", page, "CDN endpoints").await?;
        Ok(listed.endpoints)
    }

    async fn update_endpoint(
        &self,
        endpoint_id: &str,
        update: &DigitalOceanEndpointUpdate<'_>,
    ) -> Result<DigitalOceanCdnEndpoint> {
        let path = format!("/v2/cdn/endpoints/{endpoint_id}");
        debug!("[do-http] PUT {path}");
        let response = self
            .request(Method::PUT, &path)
            .json(update)
            .send()
            .await
            .context("Failed to update DigitalOcean CDN endpoint")?;
        let updated: DigitalOceanEndpointResponse =
            Self::read_json(response, "CDN endpoint").await?;
        Ok(updated.endpoint)
    }
}

/// DigitalOcean account certificate store.
///
/// Listings carry a SHA-1 fingerprint, so duplicates are detected without
/// fetching content. The API has no way to replace a certificate in place.
pub struct DigitalOceanCertificates {
    client: DigitalOceanClient,
}

impl DigitalOceanCertificates {
    pub fn new(client: DigitalOceanClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateStore for DigitalOceanCertificates {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn page_size(&self) -> u32 {
        self.client.page_size
    }

    async fn list_certificates(&self, page: PageRequest) -> Result<Vec<StoredCertificate>> {
        let listed = self.client.list_certificates(page).await?;
        Ok(listed
            .into_iter()
            .map(DigitalOceanCertificate::into_stored)
            .collect())
    }

    async fn create_certificate(&self, request: &NewCertificate<'_>) -> Result<UploadResult> {
        let (leaf_certificate, certificate_chain) = split_leaf_and_chain(request.certificate_pem)?;
        let body = DigitalOceanCreateCertificate {
            name: &request.name,
            certificate_type: "custom",
            private_key: request.private_key_pem,
            leaf_certificate,
            certificate_chain,
        };
        let created = self.client.create_certificate(&body).await?.into_stored();
        Ok(UploadResult {
            cert_id: created.id,
            cert_name: created.name.or_else(|| Some(request.name.clone())),
            extended_data: created.extended_data,
        })
    }
}

/// DigitalOcean CDN endpoints addressed by their custom domain.
pub struct DigitalOceanCdn {
    client: DigitalOceanClient,
}

impl DigitalOceanCdn {
    pub fn new(client: DigitalOceanClient) -> Self {
        Self { client }
    }

    async fn find_endpoint(
        &self,
        cancel: &CancellationToken,
        domain: &str,
    ) -> Result<Option<DigitalOceanCdnEndpoint>> {
        let wanted = canonical_host(domain);
        let client = &self.client;
        let stream = pages(cancel, client.page_size, move |request| async move {
            client
                .list_endpoints(request)
                .await
                .upstream("list CDN endpoints")
        });
        futures::pin_mut!(stream);

        while let Some(page) = stream.try_next().await? {
            let found = page.into_iter().find(|endpoint| {
                endpoint
                    .custom_domain
                    .as_deref()
                    .is_some_and(|custom| canonical_host(custom) == wanted)
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl InventorySource for DigitalOceanCdn {
    fn page_size(&self) -> u32 {
        self.client.page_size
    }

    async fn list_domains(&self, page: PageRequest) -> Result<Vec<String>> {
        let endpoints = self.client.list_endpoints(page).await?;
        Ok(endpoints
            .into_iter()
            .map(|endpoint| endpoint.custom_domain.unwrap_or_default())
            .collect())
    }
}

#[async_trait]
impl TargetBinder for DigitalOceanCdn {
    async fn bind(&self, request: BindRequest<'_>) -> Result<()> {
        let domain = request.target.value();
        let endpoint = self
            .find_endpoint(request.cancel, domain)
            .await?
            .ok_or_else(|| anyhow!("no {PLATFORM} CDN endpoint uses custom domain {domain}"))?;

        if endpoint
            .certificate_id
            .as_deref()
            .is_some_and(|current| request.cache.is_current(current, request.cert_pem))
        {
            info!(
                "[do-http] CDN endpoint {} already serves this certificate",
                endpoint.id
            );
            return Ok(());
        }

        let custom_domain = endpoint.custom_domain.as_deref().unwrap_or(domain);
        let update = DigitalOceanEndpointUpdate {
            certificate_id: &request.upload.cert_id,
            custom_domain,
        };
        let updated = self.client.update_endpoint(&endpoint.id, &update).await?;
        if updated.certificate_id.as_deref() != Some(request.upload.cert_id.as_str()) {
            return Err(anyhow!(
                "{PLATFORM} CDN endpoint {} did not take certificate {}",
                endpoint.id,
                request.upload.cert_id
            ));
        }
        Ok(())
    }
}
