use anyhow::{Result, anyhow};

pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    if let Some(suffix) = trimmed.strip_prefix("*.") {
        return Ok(format!("*.{}", normalize_domain(suffix)?));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|err| anyhow!("invalid domain name: {err}"))?;
    Ok(ascii.to_lowercase())
}

/// Comparison form of a host name. Falls back to plain lowercasing when the
/// input is not a valid IDNA domain so that comparisons never fail.
pub(crate) fn canonical_host(input: &str) -> String {
    normalize_domain(input)
        .unwrap_or_else(|_| input.trim().trim_end_matches('.').to_lowercase())
}

pub fn is_wildcard_pattern(domain: &str) -> bool {
    domain.trim().starts_with("*.")
}

/// Matches `candidate` against `pattern`.
///
/// A `*.` pattern covers exactly one extra left-most label: `*.example.com`
/// matches `a.example.com` but neither `example.com` nor `x.a.example.com`.
/// Any other pattern matches by equality. Comparison is case-insensitive.
pub fn is_wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern = canonical_host(pattern);
    let candidate = canonical_host(candidate);
    if candidate.is_empty() {
        return false;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => match candidate.split_once('.') {
            Some((label, rest)) => !label.is_empty() && label != "*" && rest == suffix,
            None => false,
        },
        None => pattern == candidate,
    }
}
