//! Unsubscribe resolution.
//!
//! `extract` finds mechanisms in a record; `UnsubscribeResolver::attempt`
//! runs one mechanism through the bounded retry policy. HTTP targets are
//! fetched through an `UnsubscribeTransport`; `mailto:` targets are never
//! acted on and come back as `Skipped`.

pub mod extract;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::normalize::EmailRecord;
use crate::retry::{AlwaysRetry, AttemptError, RetryConfig, RetryExecutor};

pub use extract::extract_mechanisms;
pub use transport::{ReqwestTransport, TransportError, UnsubscribeTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MechanismKind {
    HeaderMailto,
    HeaderHttp,
    BodyLink,
}

impl MechanismKind {
    pub fn is_header(self) -> bool {
        matches!(self, MechanismKind::HeaderMailto | MechanismKind::HeaderHttp)
    }
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MechanismKind::HeaderMailto => "header-mailto",
            MechanismKind::HeaderHttp => "header-http",
            MechanismKind::BodyLink => "body-link",
        })
    }
}

/// One way to unsubscribe, as found in the email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UnsubscribeMechanism {
    pub kind: MechanismKind,
    /// URI or `mailto:` address
    pub target: String,
    /// Header name, or a body location hint (`html:a[3]`, `text:120`)
    pub source: String,
    /// RFC 8058 one-click: attempted with a POST
    pub one_click: bool,
}

impl UnsubscribeMechanism {
    pub fn is_http(&self) -> bool {
        self.kind != MechanismKind::HeaderMailto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    Skipped,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Skipped => "skipped",
        })
    }
}

/// A single try against one mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnsubscribeAttempt {
    /// 1-based, never above the configured maximum
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub http_status: Option<u16>,
    /// Error kind (`timeout`, `connect`, `http-status`, ...) when not successful
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// All tries against one mechanism and the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MechanismResult {
    pub mechanism: UnsubscribeMechanism,
    pub outcome: AttemptOutcome,
    pub attempts: Vec<UnsubscribeAttempt>,
    /// Free-form reason for `skipped`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MechanismResult {
    pub fn skipped(mechanism: UnsubscribeMechanism, note: impl Into<String>) -> Self {
        Self {
            mechanism,
            outcome: AttemptOutcome::Skipped,
            attempts: Vec::new(),
            note: Some(note.into()),
        }
    }

    /// Human-readable detail stored in the ledger entry.
    pub fn detail(&self) -> String {
        let mut detail = format!("{} via {}", self.mechanism.kind, self.mechanism.source);
        if !self.attempts.is_empty() {
            detail.push_str(&format!(", {} attempt(s)", self.attempts.len()));
        }
        if let Some(last) = self.attempts.last() {
            if let Some(status) = last.http_status {
                detail.push_str(&format!(", last status {status}"));
            }
            if let Some(err) = &last.error {
                detail.push_str(&format!(", last error {err}"));
            }
        }
        if let Some(note) = &self.note {
            detail.push_str(&format!(", {note}"));
        }
        detail
    }
}

/// Non-2xx final status, kept apart from transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchError {
    Status(u16),
    Transport(TransportError),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status(s) => write!(f, "HTTP {s}"),
            FetchError::Transport(e) => write!(f, "{e}"),
        }
    }
}

pub struct UnsubscribeResolver {
    transport: Arc<dyn UnsubscribeTransport>,
    retry: RetryExecutor,
}

impl UnsubscribeResolver {
    pub fn new(transport: Arc<dyn UnsubscribeTransport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry: RetryExecutor::new(retry),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.config().max_attempts.max(1)
    }

    /// Ordered mechanisms for `record`: header-derived first.
    pub fn extract(&self, record: &EmailRecord) -> Vec<UnsubscribeMechanism> {
        extract_mechanisms(record)
    }

    /// Try one mechanism until it succeeds or the attempt budget runs out.
    /// Never returns an error: failures are part of the result.
    pub async fn attempt(&self, mechanism: &UnsubscribeMechanism) -> MechanismResult {
        if !mechanism.is_http() {
            debug!(target = %mechanism.target, "mailto mechanism recorded as skipped");
            return MechanismResult::skipped(mechanism.clone(), "mailto not sent");
        }

        let url = mechanism.target.as_str();
        let one_click = mechanism.one_click;
        let transport = self.transport.clone();
        let outcome = self
            .retry
            .run(
                |n| {
                    let transport = transport.clone();
                    async move {
                        debug!(url, attempt = n, one_click, "unsubscribe request");
                        match transport.fetch(url, one_click).await {
                            Ok(status) if (200..300).contains(&status) => Ok(status),
                            Ok(status) => Err(FetchError::Status(status)),
                            Err(e) => Err(FetchError::Transport(e)),
                        }
                    }
                },
                &AlwaysRetry,
            )
            .await;

        let attempts: Vec<UnsubscribeAttempt> = outcome
            .attempts
            .iter()
            .map(|a| {
                let (outcome, http_status, error) = match &a.result {
                    Ok(status) => (AttemptOutcome::Success, Some(*status), None),
                    Err(AttemptError::TimedOut(_)) => {
                        (AttemptOutcome::Timeout, None, Some("timeout".to_string()))
                    }
                    Err(AttemptError::Failed(FetchError::Transport(TransportError::Timeout))) => {
                        (AttemptOutcome::Timeout, None, Some("timeout".to_string()))
                    }
                    Err(AttemptError::Failed(FetchError::Transport(e))) => {
                        (AttemptOutcome::Failure, None, Some(e.kind().to_string()))
                    }
                    Err(AttemptError::Failed(FetchError::Status(s))) => (
                        AttemptOutcome::Failure,
                        Some(*s),
                        Some("http-status".to_string()),
                    ),
                };
                UnsubscribeAttempt {
                    attempt: a.number,
                    outcome,
                    http_status,
                    error,
                    timestamp: a.started_at,
                }
            })
            .collect();

        let final_outcome = if outcome.succeeded() {
            info!(url, attempts = attempts.len(), "unsubscribed");
            AttemptOutcome::Success
        } else {
            warn!(url, attempts = attempts.len(), "unsubscribe failed after retry budget");
            AttemptOutcome::Failure
        };

        MechanismResult {
            mechanism: mechanism.clone(),
            outcome: final_outcome,
            attempts,
            note: None,
        }
    }
}
