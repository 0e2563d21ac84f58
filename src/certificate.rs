//! Certificate identity: parsed attributes used to compare, match and verify
//! certificates across platforms.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use pem::Pem;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;

use crate::domain::{canonical_host, is_wildcard_match};
use crate::error::DeployError;

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Entry of a certificate's Subject Alternative Name extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
    Email(String),
    Uri(String),
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectAltName::Dns(name) => f.write_str(name),
            SubjectAltName::Ip(addr) => write!(f, "{addr}"),
            SubjectAltName::Email(email) => f.write_str(email),
            SubjectAltName::Uri(uri) => f.write_str(uri),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    Sha1,
    Sha256,
}

/// Immutable view of the leaf certificate of a PEM bundle.
#[derive(Debug, Clone)]
pub struct Certificate {
    subject_alt_names: Vec<SubjectAltName>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    issuer_organization: Option<String>,
    fingerprint_sha1: Vec<u8>,
    fingerprint_sha256: Vec<u8>,
    raw_der: Vec<u8>,
}

impl Certificate {
    /// Parses the first `CERTIFICATE` block of `pem_text`.
    pub fn parse(pem_text: &str) -> Result<Self, DeployError> {
        let leaf = first_certificate_block(pem_text)?;
        Self::from_der(leaf.contents())
    }

    pub fn from_der(der: &[u8]) -> Result<Self, DeployError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| DeployError::Parse(format!("invalid X.509 certificate: {e}")))?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| DeployError::Parse("notBefore out of range".into()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| DeployError::Parse("notAfter out of range".into()))?;

        let mut subject_alt_names: Vec<SubjectAltName> = Vec::new();
        let san_extension = cert
            .subject_alternative_name()
            .map_err(|e| DeployError::Parse(format!("invalid subjectAltName extension: {e}")))?;
        if let Some(extension) = san_extension {
            for name in &extension.value.general_names {
                let entry = match name {
                    GeneralName::DNSName(dns) => Some(SubjectAltName::Dns(dns.to_string())),
                    GeneralName::RFC822Name(email) => Some(SubjectAltName::Email(email.to_string())),
                    GeneralName::URI(uri) => Some(SubjectAltName::Uri(uri.to_string())),
                    GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(SubjectAltName::Ip),
                    _ => None,
                };
                if let Some(entry) = entry {
                    if !subject_alt_names.contains(&entry) {
                        subject_alt_names.push(entry);
                    }
                }
            }
        }

        let issuer_organization = cert
            .issuer()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            subject_alt_names,
            not_before,
            not_after,
            issuer_organization,
            fingerprint_sha1: Sha1::digest(der).to_vec(),
            fingerprint_sha256: Sha256::digest(der).to_vec(),
            raw_der: der.to_vec(),
        })
    }

    pub fn subject_alt_names(&self) -> &[SubjectAltName] {
        &self.subject_alt_names
    }

    /// SAN entries rendered as text, in certificate order.
    pub fn san_strings(&self) -> Vec<String> {
        self.subject_alt_names.iter().map(|san| san.to_string()).collect()
    }

    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.subject_alt_names.iter().filter_map(|san| match san {
            SubjectAltName::Dns(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn issuer_organization(&self) -> Option<&str> {
        self.issuer_organization.as_deref()
    }

    pub fn raw_der(&self) -> &[u8] {
        &self.raw_der
    }

    pub fn fingerprint(&self, algorithm: FingerprintAlgorithm) -> &[u8] {
        match algorithm {
            FingerprintAlgorithm::Sha1 => &self.fingerprint_sha1,
            FingerprintAlgorithm::Sha256 => &self.fingerprint_sha256,
        }
    }

    pub fn fingerprint_hex(&self, algorithm: FingerprintAlgorithm) -> String {
        hex::encode(self.fingerprint(algorithm))
    }

    /// TLS hostname verification against the SAN list.
    ///
    /// Wildcard entries cover exactly one left-most label, IP entries only
    /// match a literal address, and the subject CN is never consulted.
    pub fn verifies_hostname(&self, host: &str) -> bool {
        let trimmed = host.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return false;
        }

        let literal = trimmed.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return self
                .subject_alt_names
                .iter()
                .any(|san| matches!(san, SubjectAltName::Ip(addr) if *addr == ip));
        }

        let host = canonical_host(trimmed);
        self.dns_names().any(|name| dns_name_matches(name, &host))
    }
}

fn dns_name_matches(san: &str, host: &str) -> bool {
    let san = canonical_host(san);
    if san == host {
        return true;
    }
    match san.strip_prefix("*.") {
        // A bare `*.tld` entry is never honoured.
        Some(suffix) if suffix.contains('.') => is_wildcard_match(&san, host),
        _ => false,
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn certificate_blocks(pem_text: &str) -> Result<Vec<Pem>, DeployError> {
    let blocks = pem::parse_many(pem_text)
        .map_err(|err| DeployError::Parse(format!("malformed PEM: {err}")))?;
    let certs: Vec<Pem> = blocks
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_TAG)
        .collect();
    if certs.is_empty() {
        return Err(DeployError::Parse("no certificate PEM blocks found".into()));
    }
    Ok(certs)
}

fn first_certificate_block(pem_text: &str) -> Result<Pem, DeployError> {
    let mut blocks = certificate_blocks(pem_text)?;
    Ok(blocks.remove(0))
}

/// Splits a PEM bundle into the leaf certificate and the remaining chain.
/// The chain is empty when the bundle holds a single certificate.
pub fn split_leaf_and_chain(pem_text: &str) -> Result<(String, String), DeployError> {
    let encoded: Vec<String> = certificate_blocks(pem_text)?
        .iter()
        .map(pem::encode)
        .collect();
    let leaf = encoded[0].clone();
    let chain = encoded[1..].join("");
    Ok((leaf, chain))
}

/// Compares two PEM texts ignoring line breaks, tabs and spaces, so that the
/// same certificate re-wrapped by a platform still compares equal.
pub fn content_equals(a: &str, b: &str) -> bool {
    fn significant(text: &str) -> impl Iterator<Item = char> + '_ {
        text.chars()
            .filter(|c| !matches!(c, '\r' | '\n' | '\t' | ' '))
    }
    significant(a).eq(significant(b))
}
