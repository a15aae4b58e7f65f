//! Domain utilities with Public Suffix List integration.
//!
//! Sender domains are often deep subdomains (`mail.promo.example.co.uk`);
//! WHOIS only knows the registrable domain (`example.co.uk`). The PSL is
//! used to find it, with a last-two-labels fallback for unknown suffixes.

use psl::{domain_str, suffix_str};

use crate::errors::{Result, SweepError};

/// Domain information extracted using PSL or fallback parsing
#[derive(Debug, Clone, PartialEq)]
pub struct DomainInfo {
    /// The full domain as provided (cleaned)
    pub full_domain: String,
    /// The registrable domain (what you can actually register)
    pub registrable_domain: Option<String>,
    /// The public suffix (TLD or effective TLD)
    pub suffix: Option<String>,
}

impl DomainInfo {
    /// Parse a domain string into structured domain information
    pub fn parse(domain: &str) -> Result<Self> {
        let clean_domain = clean_domain_input(domain)?;
        Ok(Self::parse_with_psl(&clean_domain))
    }

    fn parse_with_psl(domain: &str) -> Self {
        let registrable_domain = domain_str(domain)
            .map(|s| s.to_string())
            .or_else(|| fallback_registrable_domain(domain));

        let suffix = suffix_str(domain)
            .map(|s| s.to_string())
            .or_else(|| domain.rsplit('.').next().map(|s| s.to_string()))
            .filter(|s| !s.is_empty());

        DomainInfo {
            full_domain: domain.to_string(),
            registrable_domain,
            suffix,
        }
    }

    /// The domain a WHOIS query should use.
    pub fn whois_domain(&self) -> &str {
        self.registrable_domain
            .as_deref()
            .unwrap_or(&self.full_domain)
    }

    /// Top-level label, used to ask IANA for the registry WHOIS server.
    pub fn tld(&self) -> &str {
        self.full_domain.rsplit('.').next().unwrap_or(&self.full_domain)
    }
}

/// Extract registrable domain from a hostname or domain string
pub fn extract_registrable_domain(domain: &str) -> Option<String> {
    DomainInfo::parse(domain).ok()?.registrable_domain
}

/// Clean domain input by removing common artifacts
fn clean_domain_input(domain: &str) -> Result<String> {
    let clean = domain
        .trim()
        .trim_start_matches('@')
        .trim_end_matches('.') // Remove trailing dot
        .to_lowercase();

    if clean.is_empty() {
        return Err(SweepError::lookup(domain, "empty domain"));
    }

    if !clean.contains('.')
        || clean
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
    {
        return Err(SweepError::lookup(
            domain,
            format!("invalid domain format: {clean}"),
        ));
    }

    Ok(clean)
}

fn fallback_registrable_domain(domain: &str) -> Option<String> {
    let parts: Vec<&str> = domain.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    Some(format!(
        "{}.{}",
        parts[parts.len() - 2],
        parts[parts.len() - 1]
    ))
}
