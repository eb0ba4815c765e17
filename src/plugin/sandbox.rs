//! Network permissions for source scripts
//!
//! A script only describes requests; the engine performs them. Before any
//! fetch the target URL is checked against the hosts the source may reach:
//! the host of its base URL (and subdomains) plus the domains its metadata
//! declares. Patterns of the form `*.example.com` match the domain and any
//! subdomain.

use crate::core::error::{Result, TingError};
use url::Url;

#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Network access whitelist (allowed domain patterns)
    allowed_domains: Vec<String>,
}

impl Sandbox {
    /// Sandbox for a source rooted at `base_url`
    pub fn for_source(base_url: &str, extra_domains: &[String]) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| TingError::ConfigError(format!("Invalid base URL {}: {}", base_url, e)))?;
        let host = base
            .host_str()
            .ok_or_else(|| TingError::ConfigError(format!("Base URL has no host: {}", base_url)))?;

        let mut allowed_domains = vec![format!("*.{}", host.to_ascii_lowercase())];
        allowed_domains.extend(
            extra_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty()),
        );

        Ok(Self { allowed_domains })
    }

    /// Check if network access is allowed
    pub fn check_network_access(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url)
            .map_err(|e| TingError::ScriptError(format!("Invalid request URL {}: {}", url, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TingError::ScriptError(format!(
                "Network access denied: unsupported scheme in {}",
                url
            )));
        }

        let domain = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        let is_allowed = self
            .allowed_domains
            .iter()
            .any(|pattern| Self::domain_matches(&domain, pattern));

        if !is_allowed {
            return Err(TingError::ScriptError(format!(
                "Network access denied: {}",
                url
            )));
        }

        Ok(parsed)
    }

    /// Get list of allowed domains
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Check if domain matches pattern (supports wildcards)
    fn domain_matches(domain: &str, pattern: &str) -> bool {
        match pattern.strip_prefix("*.") {
            Some(base) => {
                domain == base
                    || (domain.len() > base.len()
                        && domain.ends_with(base)
                        && domain.as_bytes()[domain.len() - base.len() - 1] == b'.')
            }
            None => domain == pattern,
        }
    }
}
