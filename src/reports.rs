//! Report preparation and the dispatch seam.
//!
//! The pipeline only prepares reports: one JSON document per recipient in
//! `<logs>/reports/`, plus a `report-prepared` ledger entry. Sending is the
//! job of a `ReportDispatcher`, driven by `dispatch_pending_reports`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::companies::CompanyMatch;
use crate::errors::{IoResultExt, Result};
use crate::ledger::{ActionLedger, ActionStatus, ActionType};
use crate::normalize::EmailRecord;
use crate::whois::DomainRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReportChannel {
    Email,
    /// Filed by hand through a web form
    WebForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Authority,
    Registrar,
    Company,
}

/// An anti-abuse body that accepts spam reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authority {
    pub name: &'static str,
    pub description: &'static str,
    pub channel: ReportChannel,
    /// Address for email channels, form URL for web forms
    pub recipient: &'static str,
}

pub const AUTHORITIES: &[Authority] = &[
    Authority {
        name: "FTC",
        description: "Federal Trade Commission",
        channel: ReportChannel::WebForm,
        recipient: "https://reportfraud.ftc.gov/",
    },
    Authority {
        name: "IC3",
        description: "FBI Internet Crime Complaint Center",
        channel: ReportChannel::WebForm,
        recipient: "https://www.ic3.gov/Home/FileComplaint",
    },
    Authority {
        name: "APWG",
        description: "Anti-Phishing Working Group",
        channel: ReportChannel::Email,
        recipient: "reportphishing@apwg.org",
    },
];

/// A ready-to-send report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PreparedReport {
    pub fingerprint: String,
    pub kind: ReportKind,
    pub recipient_name: String,
    /// Email address or form URL; also the ledger target
    pub recipient: String,
    pub channel: ReportChannel,
    pub subject: String,
    pub body: String,
    /// Where the original email will live once the batch is done
    pub original_email: Option<PathBuf>,
    pub prepared_at: DateTime<Utc>,
}

/// Reports for the configured authorities, plus the registrar's abuse
/// desk when WHOIS produced one.
pub fn authority_reports(
    record: &EmailRecord,
    domain: Option<&DomainRecord>,
    original_email: Option<&Path>,
) -> Vec<PreparedReport> {
    let mut reports: Vec<PreparedReport> = AUTHORITIES
        .iter()
        .map(|a| {
            build(
                record,
                ReportKind::Authority,
                format!("{} ({})", a.name, a.description),
                a.recipient,
                a.channel,
                None,
                original_email,
            )
        })
        .collect();

    if let Some(d) = domain {
        if let Some(abuse) = d.abuse_contact.as_deref() {
            let name = match d.registrar.as_deref() {
                Some(r) => format!("{r} abuse desk"),
                None => format!("Abuse contact for {}", d.domain),
            };
            reports.push(build(
                record,
                ReportKind::Registrar,
                name,
                abuse,
                ReportChannel::Email,
                Some(format!(
                    "The sending domain {} is registered through {}.",
                    d.domain,
                    d.registrar.as_deref().unwrap_or("your registrar")
                )),
                original_email,
            ));
        }
    }
    reports
}

/// One report per impersonated company.
pub fn company_reports(
    record: &EmailRecord,
    matches: &[CompanyMatch],
    original_email: Option<&Path>,
) -> Vec<PreparedReport> {
    matches
        .iter()
        .map(|m| {
            build(
                record,
                ReportKind::Company,
                m.display_name.clone(),
                &m.abuse_contact,
                ReportChannel::Email,
                Some(format!(
                    "This message appears to impersonate {} (matched \"{}\").",
                    m.display_name, m.matched_term
                )),
                original_email,
            )
        })
        .collect()
}

fn build(
    record: &EmailRecord,
    kind: ReportKind,
    recipient_name: String,
    recipient: &str,
    channel: ReportChannel,
    note: Option<String>,
    original_email: Option<&Path>,
) -> PreparedReport {
    let subject = if record.subject.is_empty() {
        "Unknown Subject"
    } else {
        record.subject.as_str()
    };
    PreparedReport {
        fingerprint: record.fingerprint.clone(),
        kind,
        recipient_name,
        recipient: recipient.to_string(),
        channel,
        subject: format!("Spam Report - {subject}"),
        body: report_body(record, note.as_deref()),
        original_email: original_email.map(Path::to_path_buf),
        prepared_at: Utc::now(),
    }
}

/// Plain-text report body.
pub fn report_body(record: &EmailRecord, note: Option<&str>) -> String {
    let or_na = |v: Option<&str>| v.filter(|s| !s.is_empty()).unwrap_or("N/A").to_string();
    let received = record.received().join("\n");
    let mut body = String::new();
    body.push_str("Spam Email Report\n================\n\n");
    body.push_str("Original Email Details:\n");
    body.push_str(&format!("- Subject: {}\n", or_na(Some(&record.subject))));
    body.push_str(&format!("- From: {}\n", or_na(record.headers.get("From"))));
    body.push_str(&format!("- Date: {}\n", or_na(record.date.as_deref())));
    body.push_str(&format!(
        "- Sender Domain: {}\n",
        or_na(record.sender_domain.as_deref())
    ));
    body.push_str(&format!(
        "- Message ID: {}\n",
        or_na(record.message_id.as_deref())
    ));
    body.push_str(&format!(
        "- Return Path: {}\n\n",
        or_na(record.headers.get("Return-Path"))
    ));
    body.push_str("Analysis:\n");
    body.push_str(&format!(
        "- Report Generated: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    body.push_str("- Classification: Unsolicited Commercial Email (Spam)\n");
    if let Some(note) = note {
        body.push_str(&format!("- {note}\n"));
    }
    body.push_str("\nPlease investigate this email for potential violations of anti-spam regulations.\n\n");
    body.push_str("Received Headers:\n");
    body.push_str(if received.is_empty() { "N/A" } else { &received });
    body.push_str("\n\nAdditional Information:\n");
    body.push_str("This report was generated automatically as part of spam email processing.\n");
    body
}

/// Directory of prepared report documents.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic location for (fingerprint, recipient).
    pub fn path_for(&self, fingerprint: &str, recipient: &str) -> PathBuf {
        let short = &fingerprint[..fingerprint.len().min(16)];
        self.dir.join(format!("{short}_{}.json", slug(recipient)))
    }

    pub fn save(&self, report: &PreparedReport) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_path(self.dir.display().to_string(), "create reports directory")?;
        let path = self.path_for(&report.fingerprint, &report.recipient);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).with_path(path.display().to_string(), "write report")?;
        Ok(path)
    }

    pub fn load(&self, fingerprint: &str, recipient: &str) -> Result<PreparedReport> {
        let path = self.path_for(fingerprint, recipient);
        let json = std::fs::read_to_string(&path).with_path(path.display().to_string(), "read report")?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn slug(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').chars().take(64).collect()
}

/// Something that actually delivers a report (SMTP, a ticket system, ...).
#[async_trait]
pub trait ReportDispatcher: Send + Sync {
    async fn dispatch(&self, report: &PreparedReport) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Hand every pending `report-prepared` entry to `dispatcher` and append
/// the matching `report-sent` entry. Ledger write failures abort.
pub async fn dispatch_pending_reports(
    ledger: &ActionLedger,
    store: &ReportStore,
    dispatcher: &dyn ReportDispatcher,
) -> Result<DispatchSummary> {
    let mut summary = DispatchSummary::default();
    for entry in ledger.pending_reports() {
        let outcome = match store.load(&entry.fingerprint, &entry.target) {
            Ok(report) => dispatcher.dispatch(&report).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!(target = %entry.target, "report sent");
                ledger.record(
                    &entry.fingerprint,
                    ActionType::ReportSent,
                    &entry.target,
                    ActionStatus::Sent,
                    None,
                )?;
                summary.sent += 1;
            }
            Err(e) => {
                warn!(target = %entry.target, error = %e, "report dispatch failed");
                ledger.record(
                    &entry.fingerprint,
                    ActionType::ReportSent,
                    &entry.target,
                    ActionStatus::Failed,
                    Some(e.to_string()),
                )?;
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companies::ContactOrigin;
    use crate::errors::SweepError;
    use crate::normalize::{EmailFormat, HeaderMap, ParsedParts};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn record() -> EmailRecord {
        let mut headers = HeaderMap::new();
        headers.push("Received", "from relay1.example.net");
        headers.push("Received", "from mx.example.org");
        headers.push("From", "\"PayPal\" <alert@paypa1.example.com>");
        headers.push("Subject", "Account limited");
        headers.push("Return-Path", "<bounce@paypa1.example.com>");
        EmailRecord::assemble(
            EmailFormat::Eml,
            ParsedParts {
                headers,
                text_body: "Verify your PayPal account".into(),
                ..Default::default()
            },
        )
    }

    fn domain(abuse: Option<&str>) -> DomainRecord {
        let mut d = DomainRecord::unresolved("paypa1.example.com", "x");
        d.error = None;
        d.registrar = Some("NameCheap, Inc.".into());
        d.abuse_contact = abuse.map(str::to_string);
        d
    }

    #[test]
    fn test_authority_reports_include_registrar_when_known() {
        let r = record();
        let reports = authority_reports(&r, Some(&domain(Some("abuse@namecheap.com"))), None);
        let recipients: Vec<&str> = reports.iter().map(|r| r.recipient.as_str()).collect();
        assert_eq!(
            recipients,
            vec![
                "https://reportfraud.ftc.gov/",
                "https://www.ic3.gov/Home/FileComplaint",
                "reportphishing@apwg.org",
                "abuse@namecheap.com"
            ]
        );
        assert_eq!(reports[3].kind, ReportKind::Registrar);
        assert_eq!(reports[0].channel, ReportChannel::WebForm);

        let reports = authority_reports(&r, Some(&domain(None)), None);
        assert_eq!(reports.len(), 3);
    }

    #[test]
    fn test_body_carries_original_details() {
        let r = record();
        let report = &company_reports(
            &r,
            &[CompanyMatch {
                company: "paypal".into(),
                display_name: "PayPal".into(),
                matched_term: "paypal".into(),
                abuse_contact: "spoof@paypal.com".into(),
                contact_origin: ContactOrigin::BuiltIn,
            }],
            Some(Path::new("processed/a.eml")),
        )[0];
        assert_eq!(report.subject, "Spam Report - Account limited");
        assert!(report.body.contains("- Return Path: <bounce@paypa1.example.com>"));
        assert!(report.body.contains("from relay1.example.net\nfrom mx.example.org"));
        assert!(report.body.contains("impersonate PayPal"));
        assert!(report.body.contains("- Message ID: N/A"));
        assert_eq!(report.original_email.as_deref(), Some(Path::new("processed/a.eml")));
    }

    struct Recorder {
        fail_for: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReportDispatcher for Recorder {
        async fn dispatch(&self, report: &PreparedReport) -> Result<()> {
            self.seen.lock().unwrap().push(report.recipient.clone());
            if self.fail_for.as_deref() == Some(report.recipient.as_str()) {
                return Err(SweepError::network("smtp", &report.recipient, "550 rejected"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_pending_marks_sent_and_failed() {
        let dir = TempDir::new().unwrap();
        let ledger = ActionLedger::open(&dir.path().join("l.jsonl"), None, "r1", true).unwrap();
        let store = ReportStore::new(dir.path().join("reports"));
        let r = record();
        for report in authority_reports(&r, Some(&domain(Some("abuse@namecheap.com"))), None) {
            store.save(&report).unwrap();
            ledger
                .record(&r.fingerprint, ActionType::ReportPrepared, &report.recipient, ActionStatus::Prepared, None)
                .unwrap();
        }

        let dispatcher = Recorder {
            fail_for: Some("abuse@namecheap.com".into()),
            seen: Mutex::new(Vec::new()),
        };
        let summary = dispatch_pending_reports(&ledger, &store, &dispatcher).await.unwrap();
        assert_eq!(summary, DispatchSummary { sent: 3, failed: 1 });

        // the failed one stays pending
        let pending = ledger.pending_reports();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "abuse@namecheap.com");
    }

    #[test]
    fn test_store_round_trip_path() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());
        let p = store.path_for("abcdef0123456789ffff", "https://reportfraud.ftc.gov/");
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "abcdef0123456789_https_reportfraud_ftc_gov.json"
        );
    }
}
