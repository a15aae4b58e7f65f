use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static EMAIL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([A-Z0-9._%+\-]+@[A-Z0-9.\-]+\.[A-Z]{2,})").unwrap());

/// Candidate abuse addresses found in free text (WHOIS answers), with a
/// simple evidence counter (larger value means "seen more often").
#[derive(Default, Debug, Clone)]
pub struct EmailSet {
    map: HashMap<String, u32>,
}

impl EmailSet {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Increase confidence by 1 (creates entry if absent).
    pub fn bump<S: AsRef<str>>(&mut self, email: S) {
        let e = canonical(email.as_ref());
        *self.map.entry(e).or_insert(0) += 1;
    }

    /// Add arbitrary confidence delta (saturating).
    pub fn add_with_conf<S: AsRef<str>>(&mut self, email: S, delta: u32) {
        let e = canonical(email.as_ref());
        let entry = self.map.entry(e).or_insert(0);
        *entry = entry.saturating_add(delta);
    }

    /// Collect every plausible address in `text`, one bump per occurrence.
    pub fn absorb_text(&mut self, text: &str) {
        for cap in EMAIL_IN_TEXT.captures_iter(text) {
            let email = cap[1].trim_end_matches('.').to_ascii_lowercase();
            if is_plausible_email(&email) {
                self.bump(&email);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove emails that belong to well known registry / infrastructure domains.
    pub fn filter_registry(&mut self, registry_domains: &[&str]) {
        self.map.retain(|e, _| match address_domain(e) {
            Some(dom) => !registry_domains
                .iter()
                .any(|rd| dom.eq_ignore_ascii_case(rd)),
            None => true,
        });
    }

    /// Sorted (confidence desc, then lexicographic) snapshot.
    pub fn sorted(&self) -> Vec<(String, u32)> {
        let mut v: Vec<_> = self.map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v
    }

    /// All addresses, best first.
    pub fn addresses(&self) -> Vec<String> {
        self.sorted().into_iter().map(|(e, _)| e).collect()
    }

    /// Best abuse-reporting address: an `abuse@` local part wins, then any
    /// address whose local part mentions abuse, otherwise nothing.
    pub fn best_abuse_contact(&self) -> Option<String> {
        let sorted = self.sorted();
        sorted
            .iter()
            .find(|(e, _)| e.starts_with("abuse@"))
            .or_else(|| {
                sorted.iter().find(|(e, _)| {
                    e.split('@')
                        .next()
                        .map(|local| local.contains("abuse"))
                        .unwrap_or(false)
                })
            })
            .map(|(e, _)| e.clone())
    }
}

/// Registry / example domains whose addresses are never an abuse contact
/// for the sender.
pub const REGISTRY_DOMAINS: [&str; 9] = [
    "iana.org",
    "icann.org",
    "ripe.net",
    "arin.net",
    "apnic.net",
    "lacnic.net",
    "afrinic.net",
    "example.net",
    "example.org",
];

/// Lightweight plausibility check (syntax only).
pub fn is_plausible_email(e: &str) -> bool {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)^[A-Z0-9._%+\-]+@[A-Z0-9.\-]+\.[A-Z]{2,}$").unwrap());
    e.len() <= 254 && RE.is_match(e)
}

/// Pull the bare address out of a `From`-style header value:
/// `"Name" <user@host>` or `user@host`.
pub fn extract_address(header_value: &str) -> Option<String> {
    static ANGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\s*([^<>\s]+@[^<>\s]+)\s*>").unwrap());
    static BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^\s<>,;:]+@[^\s<>,;]+)").unwrap());

    let candidate = ANGLE
        .captures(header_value)
        .or_else(|| BARE.captures(header_value))
        .and_then(|c| c.get(1))
        .map(|m| {
            m.as_str()
                .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
                .to_string()
        })?;
    if candidate.contains('@') {
        Some(candidate)
    } else {
        None
    }
}

/// Domain component of an address, lowercased.
pub fn address_domain(address: &str) -> Option<String> {
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches(['>', '.']).to_ascii_lowercase();
    if domain.contains('.') && !domain.is_empty() {
        Some(domain)
    } else {
        None
    }
}

/// Canonicalization used internally (lowercase).
fn canonical(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}
