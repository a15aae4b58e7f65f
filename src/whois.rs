//! Domain intelligence: WHOIS resolution with a per-run cache.
//!
//! Resolution walks IANA → registry → registrar over TCP port 43, bounded
//! by `max_whois_referrals`. Every query goes through the shared retry
//! policy (only timeouts and connection failures are retried). Lookups
//! never fail the pipeline: errors degrade into a `DomainRecord` with
//! empty fields and `error` set.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain_utils::DomainInfo;
use crate::emails::{EmailSet, REGISTRY_DOMAINS, is_plausible_email};
use crate::errors::{Result, SweepError};
use crate::retry::{RetryConfig, RetryExecutor, TransientOnly};

/// WHOIS TCP port.
const WHOIS_PORT: u16 = 43;

/// Root of every referral chain.
pub const IANA_WHOIS_SERVER: &str = "whois.iana.org";

/// Responses are cut off beyond this size.
const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

/// One raw WHOIS exchange.
#[async_trait]
pub trait WhoisClient: Send + Sync {
    async fn query(&self, server: &str, query: &str) -> Result<String>;
}

/// Plain TCP port-43 client.
#[derive(Debug, Clone)]
pub struct TcpWhoisClient {
    timeout: Duration,
}

impl TcpWhoisClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl WhoisClient for TcpWhoisClient {
    async fn query(&self, server: &str, query: &str) -> Result<String> {
        let to = self.timeout;
        let millis = to.as_millis() as u64;

        let mut stream = match timeout(to, TcpStream::connect((server, WHOIS_PORT))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(SweepError::network(
                    "whois",
                    server,
                    format!("connect error: {e}"),
                ));
            }
            Err(_) => return Err(SweepError::timeout("whois connect", server, millis)),
        };

        // canonical WHOIS: "<query>\r\n"
        let line = format!("{query}\r\n");
        match timeout(to, stream.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(SweepError::network(
                    "whois",
                    server,
                    format!("connection write failed: {e}"),
                ));
            }
            Err(_) => return Err(SweepError::timeout("whois write", server, millis)),
        }

        let mut buf = Vec::new();
        let mut limited = (&mut stream).take(MAX_RESPONSE_BYTES);
        match timeout(to, limited.read_to_end(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(SweepError::network(
                    "whois",
                    server,
                    format!("connection read failed: {e}"),
                ));
            }
            Err(_) => return Err(SweepError::timeout("whois read", server, millis)),
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Registration data for one registrable domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DomainRecord {
    /// Registrable domain that was looked up
    pub domain: String,
    pub registrar: Option<String>,
    pub creation_date: Option<String>,
    pub expiration_date: Option<String>,
    pub name_servers: Vec<String>,
    pub registrant_org: Option<String>,
    pub registrant_country: Option<String>,
    /// Every plausible address in the responses, best first
    pub emails: Vec<String>,
    /// Null when unresolved
    pub abuse_contact: Option<String>,
    /// Last server that answered
    pub whois_server: Option<String>,
    pub looked_up_at: DateTime<Utc>,
    /// Why the lookup degraded, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainRecord {
    /// Null-field record for a failed lookup.
    pub fn unresolved(domain: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            registrar: None,
            creation_date: None,
            expiration_date: None,
            name_servers: Vec::new(),
            registrant_org: None,
            registrant_country: None,
            emails: Vec::new(),
            abuse_contact: None,
            whois_server: None,
            looked_up_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.error.is_none()
    }
}

static RE_REFER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*(?:refer|whois):\s*([A-Z0-9._\-]+)\s*$").unwrap());
static RE_REGISTRAR_SERVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:Registrar WHOIS Server|Whois Server):\s*(?:whois://)?([A-Z0-9._\-]+)\s*$")
        .unwrap()
});
static RE_REGISTRAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:Registrar|Sponsoring Registrar|Registrar Name)\s*:\s*(.+?)\s*$")
        .unwrap()
});
static RE_CREATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(?:Creation Date|Created On|Created|Registered On|Registration Time|Domain Registration Date)\s*:\s*(.+?)\s*$",
    )
    .unwrap()
});
static RE_EXPIRES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(?:Registry Expiry Date|Registrar Registration Expiration Date|Expiration Date|Expiry Date|Expiration Time|paid-till|Expires On)\s*:\s*(.+?)\s*$",
    )
    .unwrap()
});
static RE_NAME_SERVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*(?:Name Server|nserver)\s*:\s*(\S+)").unwrap());
static RE_REGISTRANT_ORG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*Registrant (?:Organization|Organisation)\s*:\s*(.+?)\s*$").unwrap()
});
static RE_REGISTRANT_COUNTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*Registrant Country\s*:\s*(.+?)\s*$").unwrap());
static RE_ABUSE_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*Registrar Abuse Contact Email\s*:\s*(\S+@\S+)\s*$").unwrap()
});

const NO_MATCH_MARKERS: &[&str] = &[
    "no match for",
    "not found",
    "no data found",
    "no entries found",
    "domain not found",
    "status: free",
];

/// Fields parsed from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhoisFields {
    pub registrar: Option<String>,
    pub creation_date: Option<String>,
    pub expiration_date: Option<String>,
    pub name_servers: Vec<String>,
    pub registrant_org: Option<String>,
    pub registrant_country: Option<String>,
    pub abuse_contact: Option<String>,
}

impl WhoisFields {
    pub fn parse(response: &str) -> Self {
        let first = |re: &Regex| {
            re.captures_iter(response)
                .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
                .find(|v| !v.is_empty() && !v.to_ascii_lowercase().starts_with("redacted"))
        };

        let mut name_servers: Vec<String> = Vec::new();
        for cap in RE_NAME_SERVER.captures_iter(response) {
            let ns = cap[1].trim_end_matches('.').to_ascii_lowercase();
            if !ns.is_empty() && !name_servers.contains(&ns) {
                name_servers.push(ns);
            }
        }

        Self {
            registrar: first(&RE_REGISTRAR),
            creation_date: first(&RE_CREATED),
            expiration_date: first(&RE_EXPIRES),
            name_servers,
            registrant_org: first(&RE_REGISTRANT_ORG),
            registrant_country: first(&RE_REGISTRANT_COUNTRY),
            abuse_contact: first(&RE_ABUSE_EMAIL)
                .map(|e| e.to_ascii_lowercase())
                .filter(|e| is_plausible_email(e)),
        }
    }

    /// Fill gaps in `self` from `other`.
    fn merge(&mut self, other: WhoisFields) {
        self.registrar = self.registrar.take().or(other.registrar);
        self.creation_date = self.creation_date.take().or(other.creation_date);
        self.expiration_date = self.expiration_date.take().or(other.expiration_date);
        if self.name_servers.is_empty() {
            self.name_servers = other.name_servers;
        }
        self.registrant_org = self.registrant_org.take().or(other.registrant_org);
        self.registrant_country = self.registrant_country.take().or(other.registrant_country);
        self.abuse_contact = self.abuse_contact.take().or(other.abuse_contact);
    }
}

/// True when the server says the domain is not registered.
pub fn is_no_match(response: &str) -> bool {
    let lower = response.to_ascii_lowercase();
    NO_MATCH_MARKERS.iter().any(|m| lower.contains(m))
}

fn referral(re: &Regex, response: &str) -> Option<String> {
    re.captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_ascii_lowercase())
        .filter(|s| s.contains('.'))
}

/// WHOIS front end with a process-lifetime cache.
pub struct DomainIntel {
    client: Arc<dyn WhoisClient>,
    retry: RetryExecutor,
    max_referrals: usize,
    cache: DashMap<String, Arc<OnceCell<DomainRecord>>>,
    resolutions: AtomicU64,
    queries: AtomicU64,
}

impl DomainIntel {
    pub fn new(client: Arc<dyn WhoisClient>, retry: RetryConfig, max_referrals: usize) -> Self {
        Self {
            client,
            retry: RetryExecutor::new(retry),
            max_referrals,
            cache: DashMap::new(),
            resolutions: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Cached lookup for the registrable domain of `domain`. Concurrent
    /// callers for the same key share one resolution.
    pub async fn lookup(&self, domain: &str) -> DomainRecord {
        let info = match DomainInfo::parse(domain) {
            Ok(info) => info,
            Err(e) => return DomainRecord::unresolved(domain.trim().to_lowercase(), e.to_string()),
        };
        let key = info.whois_domain().to_string();

        let cell = self
            .cache
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let record = cell
            .get_or_init(|| async {
                self.resolutions.fetch_add(1, Ordering::SeqCst);
                match self.resolve(&info).await {
                    Ok(record) => {
                        info!(
                            domain = %key,
                            registrar = record.registrar.as_deref().unwrap_or("-"),
                            abuse = record.abuse_contact.as_deref().unwrap_or("-"),
                            "WHOIS resolved"
                        );
                        record
                    }
                    Err(e) => {
                        warn!(domain = %key, error = %e, "WHOIS lookup degraded");
                        DomainRecord::unresolved(key.clone(), e.to_string())
                    }
                }
            })
            .await;
        record.clone()
    }

    /// Number of distinct domains resolved (cache misses) so far.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::SeqCst)
    }

    /// Number of WHOIS queries sent so far, retries included.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Uncached IANA → registry → registrar walk.
    pub async fn resolve(&self, info: &DomainInfo) -> Result<DomainRecord> {
        let domain = info.whois_domain();
        let iana = self.query_with_retry(IANA_WHOIS_SERVER, info.tld()).await?;
        let registry = referral(&RE_REFER, &iana).ok_or_else(|| {
            SweepError::lookup(domain, format!("no registry WHOIS server for .{}", info.tld()))
        })?;

        let mut server = registry;
        let mut responses: Vec<(String, String)> = Vec::new();
        let mut hops = 0usize;
        loop {
            let response = match self.query_with_retry(&server, domain).await {
                Ok(r) => r,
                // a registrar outage keeps what the registry already said
                Err(e) if !responses.is_empty() => {
                    warn!(server = %server, error = %e, "registrar referral failed");
                    break;
                }
                Err(e) => return Err(e),
            };
            if is_no_match(&response) {
                if responses.is_empty() {
                    return Err(SweepError::lookup(domain, "no match"));
                }
                break;
            }
            let next = referral(&RE_REGISTRAR_SERVER, &response);
            responses.push((server.clone(), response));
            hops += 1;
            match next {
                Some(n) if hops <= self.max_referrals && responses.iter().all(|(s, _)| *s != n) => {
                    debug!(from = %server, to = %n, "WHOIS referral");
                    server = n;
                }
                _ => break,
            }
        }

        // registrar (last) answers are more specific than the registry's
        let mut fields = WhoisFields::default();
        let mut emails = EmailSet::new();
        for (_, response) in responses.iter().rev() {
            fields.merge(WhoisFields::parse(response));
            emails.absorb_text(response);
        }
        emails.filter_registry(&REGISTRY_DOMAINS);
        let abuse_contact = fields
            .abuse_contact
            .clone()
            .or_else(|| emails.best_abuse_contact());

        Ok(DomainRecord {
            domain: domain.to_string(),
            registrar: fields.registrar,
            creation_date: fields.creation_date,
            expiration_date: fields.expiration_date,
            name_servers: fields.name_servers,
            registrant_org: fields.registrant_org,
            registrant_country: fields.registrant_country,
            emails: emails.addresses(),
            abuse_contact,
            whois_server: responses.last().map(|(s, _)| s.clone()),
            looked_up_at: Utc::now(),
            error: None,
        })
    }

    async fn query_with_retry(&self, server: &str, query: &str) -> Result<String> {
        let outcome = self
            .retry
            .run(
                |attempt| {
                    self.queries.fetch_add(1, Ordering::SeqCst);
                    debug!(server, query, attempt, "WHOIS query");
                    self.client.query(server, query)
                },
                &TransientOnly,
            )
            .await;
        let millis = self.retry.config().attempt_timeout.as_millis() as u64;
        outcome.into_result().map_err(|e| match e {
            crate::retry::AttemptError::TimedOut(_) => SweepError::timeout("whois", server, millis),
            crate::retry::AttemptError::Failed(err) => err,
        })
    }
}
