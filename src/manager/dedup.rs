use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, info};
use uuid::Uuid;

use super::{
    CertificateManager, CertificateStore, NewCertificate, OperateResult, StoredCertificate,
    UploadResult,
};
use crate::cancel::{CancellationToken, cancellable};
use crate::certificate::{Certificate, FingerprintAlgorithm, content_equals};
use crate::error::{DeployError, UpstreamExt};
use crate::paging::pages;

const DEFAULT_NAME_PREFIX: &str = "certdeploy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Match,
    Mismatch,
    Unknown,
}

/// `CertificateManager` built on a platform's `CertificateStore`.
///
/// Uploads are idempotent: the store inventory is scanned page by page and
/// the first certificate with the same content is reused.
pub struct DedupCertificateManager<S> {
    store: S,
    name_prefix: String,
}

impl<S: CertificateStore> DedupCertificateManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !prefix.trim().is_empty() {
            self.name_prefix = prefix.trim().to_string();
        }
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn certificate_name(&self) -> String {
        format!("{}-{}", self.name_prefix, Uuid::new_v4().as_simple())
    }

    /// Scans the store for a certificate equal to `cert_pem`.
    async fn find_existing(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        certificate: &Certificate,
    ) -> Result<Option<StoredCertificate>, DeployError> {
        let store = &self.store;
        let stream = pages(cancel, store.page_size(), move |request| async move {
            store
                .list_certificates(request)
                .await
                .upstream("list certificates")
        });
        futures::pin_mut!(stream);

        while let Some(page) = stream.try_next().await? {
            for candidate in page {
                if self.matches(cancel, &candidate, cert_pem, certificate).await? {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    async fn matches(
        &self,
        cancel: &CancellationToken,
        candidate: &StoredCertificate,
        cert_pem: &str,
        certificate: &Certificate,
    ) -> Result<bool, DeployError> {
        match cheap_verdict(candidate, certificate) {
            Verdict::Match => return Ok(true),
            Verdict::Mismatch => return Ok(false),
            Verdict::Unknown => {}
        }

        debug!(
            "[cert-manager] {} fetching certificate {} for content comparison",
            self.store.platform(),
            candidate.id
        );
        let stored = cancellable(cancel, async {
            self.store
                .fetch_certificate_pem(&candidate.id)
                .await
                .upstream("fetch certificate")
        })
        .await?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        if content_equals(&stored, cert_pem) {
            return Ok(true);
        }
        // Platforms may keep the leaf only or re-encode the chain.
        Ok(Certificate::parse(&stored)
            .map(|parsed| {
                parsed.fingerprint(FingerprintAlgorithm::Sha256)
                    == certificate.fingerprint(FingerprintAlgorithm::Sha256)
            })
            .unwrap_or(false))
    }
}

/// Compares the signals a listing already carries. Fingerprints are
/// conclusive; a validity window can only rule a candidate out.
fn cheap_verdict(candidate: &StoredCertificate, certificate: &Certificate) -> Verdict {
    if let Some(fingerprint) = &candidate.fingerprint_sha256 {
        return if fingerprint.as_slice() == certificate.fingerprint(FingerprintAlgorithm::Sha256) {
            Verdict::Match
        } else {
            Verdict::Mismatch
        };
    }
    if let Some(fingerprint) = &candidate.fingerprint_sha1 {
        return if fingerprint.as_slice() == certificate.fingerprint(FingerprintAlgorithm::Sha1) {
            Verdict::Match
        } else {
            Verdict::Mismatch
        };
    }
    if candidate
        .not_before
        .is_some_and(|not_before| not_before != certificate.not_before())
    {
        return Verdict::Mismatch;
    }
    if candidate
        .not_after
        .is_some_and(|not_after| not_after != certificate.not_after())
    {
        return Verdict::Mismatch;
    }
    Verdict::Unknown
}

fn require_key(key_pem: &str) -> Result<(), DeployError> {
    if key_pem.trim().is_empty() {
        return Err(DeployError::config("private key PEM is required"));
    }
    Ok(())
}

#[async_trait]
impl<S: CertificateStore> CertificateManager for DedupCertificateManager<S> {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<UploadResult, DeployError> {
        let certificate = Certificate::parse(cert_pem)?;
        require_key(key_pem)?;
        let platform = self.store.platform();

        if let Some(existing) = self.find_existing(cancel, cert_pem, &certificate).await? {
            info!(
                "[cert-manager] {platform} already holds this certificate id={}",
                existing.id
            );
            return Ok(UploadResult {
                cert_id: existing.id,
                cert_name: existing.name,
                extended_data: existing.extended_data,
            });
        }

        let request = NewCertificate {
            name: self.certificate_name(),
            certificate_pem: cert_pem,
            private_key_pem: key_pem,
            certificate: &certificate,
        };
        let created = cancellable(cancel, async {
            Ok(self.store.create_certificate(&request).await)
        })
        .await?;

        match created {
            Ok(result) => {
                info!(
                    "[cert-manager] {platform} created certificate id={} name={}",
                    result.cert_id, request.name
                );
                Ok(result)
            }
            Err(err) => match self.store.existing_id_from_create_error(&err) {
                Some(cert_id) => {
                    info!(
                        "[cert-manager] {platform} rejected a duplicate upload, reusing id={cert_id}"
                    );
                    Ok(UploadResult {
                        cert_id,
                        cert_name: None,
                        extended_data: Default::default(),
                    })
                }
                None => Err(DeployError::upstream("create certificate", err)),
            },
        }
    }

    async fn replace(
        &self,
        cancel: &CancellationToken,
        cert_id_or_name: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<OperateResult, DeployError> {
        if !self.store.supports_replace() {
            return Err(DeployError::Unsupported(format!(
                "{} does not support in-place certificate replacement",
                self.store.platform()
            )));
        }
        if cert_id_or_name.trim().is_empty() {
            return Err(DeployError::config("certificate id or name to replace is required"));
        }
        let certificate = Certificate::parse(cert_pem)?;
        require_key(key_pem)?;

        let request = NewCertificate {
            name: cert_id_or_name.to_string(),
            certificate_pem: cert_pem,
            private_key_pem: key_pem,
            certificate: &certificate,
        };
        let result = cancellable(cancel, async {
            self.store
                .replace_certificate(cert_id_or_name, &request)
                .await
                .upstream("replace certificate")
        })
        .await?;
        info!(
            "[cert-manager] {} replaced certificate id={}",
            self.store.platform(),
            result.cert_id
        );
        Ok(result)
    }
}
