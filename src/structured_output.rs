//! Structured output: per-email metadata records, the daily summary and
//! the run document printed with `--json` / `--yaml`.
//!
//! These structures are both the JSONL file format and the machine-readable
//! CLI output, so field names are part of the external interface.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::companies::CompanyMatch;
use crate::errors::{IoResultExt, Result, SweepError};
use crate::normalize::{AttachmentInfo, EmailFormat, EmailRecord};
use crate::pipeline::EmailState;
use crate::reports::{PreparedReport, ReportChannel, ReportKind};
use crate::unsubscribe::{AttemptOutcome, MechanismResult};
use crate::whois::DomainRecord;

/// One processed email, success or not.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct MetadataRecord {
    /// Email fingerprint (SHA-256 of the raw bytes when parsing failed)
    pub fingerprint: String,

    /// Source file as found in the consume directory
    pub file: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<EmailFormat>,

    /// Final pipeline state
    pub state: EmailState,

    pub sender: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_domain: Option<String>,

    pub subject: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_path: Option<String>,

    /// `Received` chain, most recent hop first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_mailer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_originating_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInfo>,

    /// Every extracted mechanism with its attempts, in attempt order
    #[serde(default)]
    pub unsubscribe: Vec<MechanismResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainRecord>,

    #[serde(default)]
    pub company_matches: Vec<CompanyMatch>,

    #[serde(default)]
    pub reports: Vec<ReportRef>,

    /// Where the file was moved, if it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,

    pub processed_at: DateTime<Utc>,
}

/// Short pointer to a prepared report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ReportRef {
    pub kind: ReportKind,
    pub recipient: String,
    pub channel: ReportChannel,
}

impl From<&PreparedReport> for ReportRef {
    fn from(r: &PreparedReport) -> Self {
        Self {
            kind: r.kind,
            recipient: r.recipient.clone(),
            channel: r.channel,
        }
    }
}

impl MetadataRecord {
    /// Record for a normalized email; stage results are filled in later.
    pub fn from_email(record: &EmailRecord, file: &Path) -> Self {
        let header = |name: &str| record.headers.get(name).map(str::to_string);
        Self {
            fingerprint: record.fingerprint.clone(),
            file: file.display().to_string(),
            format: Some(record.format),
            state: EmailState::Normalized,
            sender: record.sender.clone(),
            sender_domain: record.sender_domain.clone(),
            subject: record.subject.clone(),
            date: record.date.clone(),
            message_id: record.message_id.clone(),
            to: header("To"),
            return_path: header("Return-Path"),
            received: record.received().into_iter().map(str::to_string).collect(),
            x_mailer: header("X-Mailer"),
            x_originating_ip: header("X-Originating-IP"),
            attachments: record.attachments.clone(),
            unsubscribe: Vec::new(),
            domain: None,
            company_matches: Vec::new(),
            reports: Vec::new(),
            moved_to: None,
            error: None,
            error_category: None,
            processed_at: Utc::now(),
        }
    }

    /// Record for a file that never got past normalization.
    pub fn failed(
        fingerprint: String,
        file: &Path,
        format: Option<EmailFormat>,
        error: &SweepError,
    ) -> Self {
        Self {
            fingerprint,
            file: file.display().to_string(),
            format,
            state: EmailState::Failed,
            sender: String::new(),
            sender_domain: None,
            subject: String::new(),
            date: None,
            message_id: None,
            to: None,
            return_path: None,
            received: Vec::new(),
            x_mailer: None,
            x_originating_ip: None,
            attachments: Vec::new(),
            unsubscribe: Vec::new(),
            domain: None,
            company_matches: Vec::new(),
            reports: Vec::new(),
            moved_to: None,
            error: Some(error.to_string()),
            error_category: Some(error.category().to_string()),
            processed_at: Utc::now(),
        }
    }

    /// JSON schema for this record
    pub fn generate_json_schema() -> Result<String> {
        let schema = schemars::schema_for!(MetadataRecord);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

/// Totals for one calendar day, accumulated across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DailySummary {
    pub date: NaiveDate,
    #[serde(default)]
    pub runs: Vec<String>,
    pub total_emails_processed: u64,
    pub emails_failed: u64,
    pub total_unsubscribe_attempts: u64,
    pub successful_unsubscribes: u64,
    pub failed_unsubscribes: u64,
    pub skipped_unsubscribes: u64,
    pub domains_encountered: BTreeSet<String>,
    pub companies_identified: BTreeSet<String>,
    pub authority_reports_prepared: u64,
    pub company_reports_prepared: u64,
    pub generated_at: DateTime<Utc>,
}

impl DailySummary {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            runs: Vec::new(),
            total_emails_processed: 0,
            emails_failed: 0,
            total_unsubscribe_attempts: 0,
            successful_unsubscribes: 0,
            failed_unsubscribes: 0,
            skipped_unsubscribes: 0,
            domains_encountered: BTreeSet::new(),
            companies_identified: BTreeSet::new(),
            authority_reports_prepared: 0,
            company_reports_prepared: 0,
            generated_at: Utc::now(),
        }
    }

    /// `summary_report_<YYYYMMDD>.json`
    pub fn file_name(date: NaiveDate) -> String {
        format!("summary_report_{}.json", date.format("%Y%m%d"))
    }

    /// Today's summary in `dir`, or a fresh one.
    pub fn load_or_new(dir: &Path, date: NaiveDate) -> Result<Self> {
        let path = dir.join(Self::file_name(date));
        if !path.exists() {
            return Ok(Self::new(date));
        }
        let json =
            std::fs::read_to_string(&path).with_path(path.display().to_string(), "read summary")?;
        match serde_json::from_str::<Self>(&json) {
            Ok(summary) if summary.date == date => Ok(summary),
            Ok(_) => Ok(Self::new(date)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "replacing unreadable summary");
                Ok(Self::new(date))
            }
        }
    }

    pub fn today(dir: &Path) -> Result<Self> {
        Self::load_or_new(dir, Local::now().date_naive())
    }

    pub fn add_run(&mut self, run_id: &str) {
        if !self.runs.iter().any(|r| r == run_id) {
            self.runs.push(run_id.to_string());
        }
    }

    pub fn absorb(&mut self, record: &MetadataRecord) {
        self.generated_at = Utc::now();
        if record.state == EmailState::Failed {
            self.emails_failed += 1;
            return;
        }
        self.total_emails_processed += 1;
        if let Some(d) = &record.sender_domain {
            self.domains_encountered.insert(d.clone());
        }
        for m in &record.unsubscribe {
            match m.outcome {
                AttemptOutcome::Skipped => self.skipped_unsubscribes += 1,
                AttemptOutcome::Success => {
                    self.total_unsubscribe_attempts += 1;
                    self.successful_unsubscribes += 1;
                }
                AttemptOutcome::Failure | AttemptOutcome::Timeout => {
                    self.total_unsubscribe_attempts += 1;
                    self.failed_unsubscribes += 1;
                }
            }
        }
        for c in &record.company_matches {
            self.companies_identified.insert(c.display_name.clone());
        }
        for r in &record.reports {
            match r.kind {
                ReportKind::Authority | ReportKind::Registrar => {
                    self.authority_reports_prepared += 1
                }
                ReportKind::Company => self.company_reports_prepared += 1,
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir).with_path(dir.display().to_string(), "create logs directory")?;
        let path = dir.join(Self::file_name(self.date));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_path(path.display().to_string(), "write summary")?;
        Ok(path)
    }
}

/// Files a run wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct OutputFiles {
    pub ledger: String,
    pub actions_taken: String,
    pub email_metadata: String,
    pub summary: String,
    pub reports_dir: String,
}

/// Counters for the run just finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RunTotals {
    pub files_found: u64,
    pub completed: u64,
    pub failed: u64,
    pub moved: u64,
    pub unsubscribe_successes: u64,
    pub unsubscribe_failures: u64,
    pub reports_prepared: u64,
    /// Set when the operator interrupted the batch
    pub interrupted: bool,
}

/// Everything `--json` / `--yaml` prints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RunOutput {
    pub tool_name: String,
    pub version: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub totals: RunTotals,
    pub emails: Vec<MetadataRecord>,
    pub daily_summary: DailySummary,
    pub files: OutputFiles,
}

impl RunOutput {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SweepError::internal_with("YAML serialization failed", e))
    }
}
