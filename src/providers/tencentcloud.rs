//! Tencent Cloud SSL certificate service.
//!
//! Certificates are uploaded to the account's certificate store and pushed to
//! cloud resources by deployment records that Tencent Cloud runs on its side.
//! Replacing in place uses `UpdateCertificateInstance` and
//! `DescribeHostUpdateRecordDetail`; binding a new identity to listed
//! instances uses `DeployCertificateInstance` and
//! `DescribeHostDeployRecordDetail`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::http;
use crate::executor::{JobCounters, JobPlatform, JobSubmission, JobVariant};
use crate::manager::{CertificateStore, NewCertificate, StoredCertificate, UploadResult};
use crate::paging::{DEFAULT_PAGE_SIZE, PageRequest};

type HmacSha256 = Hmac<Sha256>;

const PLATFORM: &str = "Tencent Cloud";
pub const DEFAULT_ENDPOINT: &str = "https://ssl.tencentcloudapi.com";
const SERVICE: &str = "ssl";
const API_VERSION: &str = "2019-12-05";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
/// Certificate validity times are reported in China Standard Time.
const CST_OFFSET_SECS: i32 = 8 * 3600;

/// Signed access to the Tencent Cloud SSL API (TC3-HMAC-SHA256).
#[derive(Debug, Clone)]
pub struct TencentCloudClient {
    secret_id: String,
    secret_key: String,
    endpoint: String,
    page_size: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCertificates {
    offset: u64,
    limit: u32,
    certificate_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCertificatesResponse {
    #[serde(default)]
    certificates: Option<Vec<TencentCertificate>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TencentCertificate {
    certificate_id: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    cert_begin_time: Option<String>,
    #[serde(default)]
    cert_end_time: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCertificateDetail<'a> {
    certificate_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCertificateDetailResponse {
    #[serde(default)]
    certificate_public_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UploadCertificate<'a> {
    certificate_public_key: &'a str,
    certificate_private_key: &'a str,
    certificate_type: &'static str,
    alias: &'a str,
    repeatable: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UploadCertificateResponse {
    #[serde(default)]
    certificate_id: Option<String>,
    #[serde(default)]
    repeat_cert_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceTypeRegions<'a> {
    resource_type: &'a str,
    regions: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateCertificateInstance<'a> {
    old_certificate_id: &'a str,
    certificate_id: &'a str,
    resource_types: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    resource_types_regions: Vec<ResourceTypeRegions<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeployCertificateInstance<'a> {
    certificate_id: &'a str,
    instance_id_list: &'a [String],
    resource_type: &'a str,
    status: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeployRecordResponse {
    #[serde(default)]
    deploy_record_id: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDeployRecord<'a> {
    deploy_record_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordCounts {
    #[serde(default)]
    total_count: Option<u64>,
    #[serde(default)]
    success_total_count: Option<u64>,
    #[serde(default)]
    failed_total_count: Option<u64>,
    #[serde(default)]
    running_total_count: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateRecordDetailResponse {
    #[serde(default)]
    record_detail_list: Option<Vec<RecordCounts>>,
    #[serde(flatten)]
    overall: RecordCounts,
}

impl RecordCounts {
    /// Tencent Cloud reports no pending count; whatever is neither finished
    /// nor running is pending.
    fn counters(&self) -> JobCounters {
        let total = self.total_count.unwrap_or_default();
        let succeeded = self.success_total_count.unwrap_or_default();
        let failed = self.failed_total_count.unwrap_or_default();
        let running = self.running_total_count.unwrap_or_default();
        let pending = total
            .checked_sub(succeeded)
            .and_then(|rest| rest.checked_sub(failed))
            .and_then(|rest| rest.checked_sub(running))
            .unwrap_or_default();
        JobCounters {
            pending,
            running,
            succeeded,
            failed,
            total,
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| anyhow!("invalid {PLATFORM} signing key: {err}"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn parse_cst(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    FixedOffset::east_opt(CST_OFFSET_SECS)?
        .from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
}

fn api_error(action: &str, error: &Value) -> anyhow::Error {
    let code = error.get("Code").and_then(Value::as_str).unwrap_or("Unknown");
    let message = error.get("Message").and_then(Value::as_str).unwrap_or_default();
    if code.starts_with("AuthFailure") {
        return anyhow!("{PLATFORM} authentication failed: {message}");
    }
    if code.starts_with("RequestLimitExceeded") {
        return anyhow!("{PLATFORM} rate limit exceeded");
    }
    anyhow!("{PLATFORM} {action} failed ({code}): {message}")
}

impl TencentCloudClient {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn host(&self) -> &str {
        let without_scheme = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }

    fn authorization(&self, payload: &str, timestamp: i64) -> Result<String> {
        let date = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| anyhow!("timestamp {timestamp} out of range"))?
            .format("%Y-%m-%d")
            .to_string();
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{}\n\ncontent-type;host\n{}",
            self.host(),
            sha256_hex(payload.as_bytes())
        );
        let scope = format!("{date}/{SERVICE}/tc3_request");
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{timestamp}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let secret_service = hmac_sha256(&secret_date, SERVICE.as_bytes())?;
        let secret_signing = hmac_sha256(&secret_service, b"tc3_request")?;
        let signature = hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes())?);

        Ok(format!(
            "TC3-HMAC-SHA256 Credential={}/{scope}, SignedHeaders=content-type;host, Signature={signature}",
            self.secret_id
        ))
    }

    async fn call<B: Serialize, T: DeserializeOwned>(&self, action: &str, body: &B) -> Result<T> {
        let payload = serde_json::to_string(body)
            .with_context(|| format!("Failed to encode {PLATFORM} {action} request"))?;
        let timestamp = Utc::now().timestamp();
        let authorization = self.authorization(&payload, timestamp)?;

        debug!("[tencent-ssl] {action}");
        let response = http::HttpClient::shared()
            .post(format!("{}/", self.endpoint))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .body(payload)
            .send()
            .await
            .with_context(|| format!("Failed to call {PLATFORM} {action}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(http::status_error(PLATFORM, status, Some(body)));
        }

        let mut envelope: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {PLATFORM} {action} response"))?;
        let result = envelope
            .get_mut("Response")
            .map(Value::take)
            .ok_or_else(|| anyhow!("{PLATFORM} {action} response has no Response object"))?;
        if let Some(error) = result.get("Error") {
            return Err(api_error(action, error));
        }
        serde_json::from_value(result)
            .with_context(|| format!("Failed to parse {PLATFORM} {action} response"))
    }

    async fn record_id(&self, action: &str, body: &impl Serialize) -> Result<String> {
        let created: DeployRecordResponse = self.call(action, body).await?;
        match created.deploy_record_id {
            Some(id) if id > 0 => Ok(id.to_string()),
            _ => Err(anyhow!("{PLATFORM} {action} returned no deployment record")),
        }
    }
}

/// Certificates uploaded to the Tencent Cloud SSL service.
///
/// Listings carry validity times but no fingerprint, so undecided
/// candidates are fetched and compared by content.
pub struct TencentCloudCertificates {
    client: TencentCloudClient,
}

impl TencentCloudCertificates {
    pub fn new(client: TencentCloudClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateStore for TencentCloudCertificates {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn page_size(&self) -> u32 {
        self.client.page_size
    }

    async fn list_certificates(&self, page: PageRequest) -> Result<Vec<StoredCertificate>> {
        let request = DescribeCertificates {
            offset: page.offset(),
            limit: page.page_size,
            certificate_type: "SVR",
        };
        let listed: DescribeCertificatesResponse =
            self.client.call("DescribeCertificates", &request).await?;
        Ok(listed
            .certificates
            .unwrap_or_default()
            .into_iter()
            .map(|certificate| {
                let mut extended_data = Map::new();
                if let Some(domain) = certificate.domain {
                    extended_data.insert("domain".into(), Value::String(domain));
                }
                StoredCertificate {
                    id: certificate.certificate_id,
                    name: certificate.alias.filter(|alias| !alias.is_empty()),
                    not_before: certificate.cert_begin_time.as_deref().and_then(parse_cst),
                    not_after: certificate.cert_end_time.as_deref().and_then(parse_cst),
                    extended_data,
                    ..StoredCertificate::default()
                }
            })
            .collect())
    }

    async fn fetch_certificate_pem(&self, id: &str) -> Result<Option<String>> {
        let detail: DescribeCertificateDetailResponse = self
            .client
            .call(
                "DescribeCertificateDetail",
                &DescribeCertificateDetail { certificate_id: id },
            )
            .await?;
        Ok(detail.certificate_public_key.filter(|pem| !pem.trim().is_empty()))
    }

    async fn create_certificate(&self, request: &NewCertificate<'_>) -> Result<UploadResult> {
        let upload = UploadCertificate {
            certificate_public_key: request.certificate_pem,
            certificate_private_key: request.private_key_pem,
            certificate_type: "SVR",
            alias: &request.name,
            repeatable: false,
        };
        let uploaded: UploadCertificateResponse =
            self.client.call("UploadCertificate", &upload).await?;

        // With `Repeatable: false` the service answers a duplicate upload
        // with the id of the certificate it already holds.
        if let Some(existing) = uploaded.repeat_cert_id.filter(|id| !id.is_empty()) {
            info!("[tencent-ssl] upload matched existing certificate {existing}");
            let mut extended_data = Map::new();
            extended_data.insert("repeated".into(), Value::Bool(true));
            return Ok(UploadResult {
                cert_id: existing,
                cert_name: None,
                extended_data,
            });
        }
        let cert_id = uploaded
            .certificate_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("{PLATFORM} UploadCertificate returned no certificate id"))?;
        Ok(UploadResult {
            cert_id,
            cert_name: Some(request.name.clone()),
            extended_data: Map::new(),
        })
    }
}

/// Deployment records of the Tencent Cloud SSL service.
pub struct TencentCloudDeployJobs {
    client: TencentCloudClient,
}

impl TencentCloudDeployJobs {
    pub fn new(client: TencentCloudClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobPlatform for TencentCloudDeployJobs {
    async fn submit_job(&self, submission: &JobSubmission<'_>) -> Result<String> {
        match submission.variant {
            JobVariant::ReplaceInPlace => {
                let old_certificate_id = submission
                    .previous_cert_id
                    .ok_or_else(|| anyhow!("replacing in place needs the previous certificate id"))?;
                if submission.resource_types.is_empty() {
                    return Err(anyhow!("replacing in place needs at least one resource type"));
                }
                let resource_types_regions = if submission.regions.is_empty() {
                    Vec::new()
                } else {
                    submission
                        .resource_types
                        .iter()
                        .map(|resource_type| ResourceTypeRegions {
                            resource_type,
                            regions: submission.regions,
                        })
                        .collect()
                };
                let request = UpdateCertificateInstance {
                    old_certificate_id,
                    certificate_id: submission.cert_id,
                    resource_types: submission.resource_types,
                    resource_types_regions,
                };
                self.client
                    .record_id("UpdateCertificateInstance", &request)
                    .await
            }
            JobVariant::Rebind => {
                let [resource_type] = submission.resource_types else {
                    return Err(anyhow!(
                        "binding to instances needs exactly one resource type, got {}",
                        submission.resource_types.len()
                    ));
                };
                if submission.instance_ids.is_empty() {
                    return Err(anyhow!("binding to instances needs at least one instance id"));
                }
                let request = DeployCertificateInstance {
                    certificate_id: submission.cert_id,
                    instance_id_list: submission.instance_ids,
                    resource_type,
                    status: 1,
                };
                self.client
                    .record_id("DeployCertificateInstance", &request)
                    .await
            }
        }
    }

    async fn job_status(&self, variant: JobVariant, job_id: &str) -> Result<Vec<JobCounters>> {
        let request = DescribeDeployRecord {
            deploy_record_id: job_id,
        };
        match variant {
            JobVariant::ReplaceInPlace => {
                let detail: UpdateRecordDetailResponse = self
                    .client
                    .call("DescribeHostUpdateRecordDetail", &request)
                    .await?;
                let shards: Vec<JobCounters> = detail
                    .record_detail_list
                    .unwrap_or_default()
                    .iter()
                    .map(RecordCounts::counters)
                    .collect();
                if shards.is_empty() {
                    return Ok(vec![detail.overall.counters()]);
                }
                Ok(shards)
            }
            JobVariant::Rebind => {
                let detail: RecordCounts = self
                    .client
                    .call("DescribeHostDeployRecordDetail", &request)
                    .await?;
                Ok(vec![detail.counters()])
            }
        }
    }
}
