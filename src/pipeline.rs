//! Per-email orchestration.
//!
//! ```text
//! Received → Normalized → { Unsubscribed, DomainResolved, CompanyMatched }
//!          → ReportsPrepared → Completed
//! Received → Failed            (normalization only)
//! ```
//!
//! The three middle stages are independent and run concurrently. Network
//! and lookup problems degrade inside their stage; the only errors that
//! leave `process_file` are fatal ones (ledger writes).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::companies::{CompanyMatch, CompanyMatcher};
use crate::config::Config;
use crate::errors::{IoResultExt, Result, SweepError};
use crate::ledger::{ActionLedger, ActionStatus, ActionType};
use crate::normalize::{EmailFormat, EmailRecord, normalize, raw_fingerprint};
use crate::reports::{ReportStore, authority_reports, company_reports};
use crate::structured_output::{MetadataRecord, ReportRef};
use crate::unsubscribe::{
    AttemptOutcome, MechanismResult, ReqwestTransport, UnsubscribeResolver, UnsubscribeTransport,
};
use crate::whois::{DomainIntel, DomainRecord, TcpWhoisClient, WhoisClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailState {
    Received,
    Normalized,
    Unsubscribed,
    DomainResolved,
    CompanyMatched,
    ReportsPrepared,
    Completed,
    Failed,
}

impl fmt::Display for EmailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmailState::Received => "received",
            EmailState::Normalized => "normalized",
            EmailState::Unsubscribed => "unsubscribed",
            EmailState::DomainResolved => "domain_resolved",
            EmailState::CompanyMatched => "company_matched",
            EmailState::ReportsPrepared => "reports_prepared",
            EmailState::Completed => "completed",
            EmailState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Moves completed emails out of the consume directory.
#[async_trait]
pub trait FileMover: Send + Sync {
    /// Where `source` will end up.
    fn destination(&self, source: &Path) -> PathBuf;

    async fn move_file(&self, source: &Path) -> Result<PathBuf>;
}

/// Rename into a directory, suffixing `-N` on name collisions.
#[derive(Debug, Clone)]
pub struct FsFileMover {
    dir: PathBuf,
}

impl FsFileMover {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FileMover for FsFileMover {
    fn destination(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "email".into());
        let candidate = self.dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "email".to_string());
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| self.dir.join(format!("{stem}-{n}{ext}")))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }

    async fn move_file(&self, source: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_path(self.dir.display().to_string(), "create processed directory")?;
        let dest = self.destination(source);
        if tokio::fs::rename(source, &dest).await.is_err() {
            // rename fails across filesystems
            tokio::fs::copy(source, &dest)
                .await
                .with_path(dest.display().to_string(), "copy email")?;
            tokio::fs::remove_file(source)
                .await
                .with_path(source.display().to_string(), "remove email")?;
        }
        Ok(dest)
    }
}

/// Stage toggles.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub auto_unsubscribe: bool,
    pub authority_reporting: bool,
    pub company_reporting: bool,
    pub max_file_size_bytes: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            auto_unsubscribe: true,
            authority_reporting: true,
            company_reporting: true,
            max_file_size_bytes: 50 * 1024 * 1024,
        }
    }
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            auto_unsubscribe: config.features.auto_unsubscribe,
            authority_reporting: config.features.authority_reporting,
            company_reporting: config.features.company_reporting,
            max_file_size_bytes: config.processing.max_file_size_bytes,
        }
    }
}

/// Result of driving one file through the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessedEmail {
    pub state: EmailState,
    /// States visited, in order
    pub transitions: Vec<EmailState>,
    pub metadata: MetadataRecord,
}

pub struct Pipeline {
    resolver: UnsubscribeResolver,
    intel: Arc<DomainIntel>,
    matcher: CompanyMatcher,
    ledger: Arc<ActionLedger>,
    reports: ReportStore,
    mover: Option<Arc<dyn FileMover>>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        resolver: UnsubscribeResolver,
        intel: Arc<DomainIntel>,
        matcher: CompanyMatcher,
        ledger: Arc<ActionLedger>,
        reports: ReportStore,
        options: PipelineOptions,
    ) -> Self {
        Self {
            resolver,
            intel,
            matcher,
            ledger,
            reports,
            mover: None,
            options,
        }
    }

    pub fn with_mover(mut self, mover: Arc<dyn FileMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    /// Production wiring: reqwest for unsubscribes, TCP for WHOIS.
    pub fn from_config(config: &Config, ledger: Arc<ActionLedger>) -> Result<Self> {
        let transport: Arc<dyn UnsubscribeTransport> =
            Arc::new(ReqwestTransport::new(config.request_timeout())?);
        let whois: Arc<dyn WhoisClient> = Arc::new(TcpWhoisClient::new(config.whois_timeout()));
        Self::from_parts(config, ledger, transport, whois)
    }

    /// Wiring with caller-supplied network seams.
    pub fn from_parts(
        config: &Config,
        ledger: Arc<ActionLedger>,
        transport: Arc<dyn UnsubscribeTransport>,
        whois: Arc<dyn WhoisClient>,
    ) -> Result<Self> {
        let resolver = UnsubscribeResolver::new(transport, config.unsubscribe_retry());
        let intel = Arc::new(DomainIntel::new(
            whois,
            config.whois_retry(),
            config.processing.max_whois_referrals,
        ));
        let matcher = CompanyMatcher::new(&config.additional_company_contacts)?;
        let mut pipeline = Self::new(
            resolver,
            intel,
            matcher,
            ledger,
            ReportStore::new(config.reports_dir()),
            PipelineOptions::from(config),
        );
        if config.processing.move_processed {
            pipeline = pipeline.with_mover(Arc::new(FsFileMover::new(
                config.directories.processed.clone(),
            )));
        }
        Ok(pipeline)
    }

    pub fn ledger(&self) -> &Arc<ActionLedger> {
        &self.ledger
    }

    pub fn intel(&self) -> &Arc<DomainIntel> {
        &self.intel
    }

    /// Read, normalize and process one file.
    pub async fn process_file(&self, path: &Path) -> Result<ProcessedEmail> {
        let format = EmailFormat::from_path(path);
        let bytes = match self.read_input(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let fingerprint = raw_fingerprint(path.display().to_string().as_bytes());
                return self.fail(path, fingerprint, format, e);
            }
        };
        let Some(format) = format else {
            let err = SweepError::unsupported_format(
                path.display().to_string(),
                "expected a .eml or .msg extension",
            );
            return self.fail(path, raw_fingerprint(&bytes), None, err);
        };
        self.process_bytes(path, format, &bytes).await
    }

    async fn read_input(&self, path: &Path) -> Result<Vec<u8>> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_path(path.display().to_string(), "stat email")?;
        if meta.len() > self.options.max_file_size_bytes {
            return Err(SweepError::unsupported_format(
                path.display().to_string(),
                format!(
                    "file is {} bytes, limit is {}",
                    meta.len(),
                    self.options.max_file_size_bytes
                ),
            ));
        }
        tokio::fs::read(path)
            .await
            .with_path(path.display().to_string(), "read email")
    }

    /// Process already-loaded bytes; `path` names the source file.
    pub async fn process_bytes(
        &self,
        path: &Path,
        format: EmailFormat,
        bytes: &[u8],
    ) -> Result<ProcessedEmail> {
        let record = match normalize(format, bytes) {
            Ok(record) => record,
            Err(e) => return self.fail(path, raw_fingerprint(bytes), Some(format), e),
        };
        debug!(
            file = %path.display(),
            fingerprint = record.short_fingerprint(),
            sender = %record.sender,
            "normalized"
        );

        let mut transitions = vec![EmailState::Received, EmailState::Normalized];
        let mut metadata = MetadataRecord::from_email(&record, path);

        let (unsubscribe, domain, companies) = tokio::join!(
            self.unsubscribe_stage(&record),
            self.domain_stage(&record),
            self.company_stage(&record),
        );
        metadata.unsubscribe = unsubscribe?;
        transitions.push(EmailState::Unsubscribed);
        metadata.domain = domain?;
        transitions.push(EmailState::DomainResolved);
        metadata.company_matches = companies?;
        transitions.push(EmailState::CompanyMatched);

        let destination = self.mover.as_ref().map(|m| m.destination(path));
        metadata.reports = self.report_stage(
            &record,
            metadata.domain.as_ref(),
            &metadata.company_matches,
            destination.as_deref().unwrap_or(path),
        )?;
        transitions.push(EmailState::ReportsPrepared);

        transitions.push(EmailState::Completed);
        metadata.state = EmailState::Completed;

        if let Some(mover) = &self.mover {
            match mover.move_file(path).await {
                Ok(dest) => {
                    debug!(from = %path.display(), to = %dest.display(), "moved");
                    metadata.moved_to = Some(dest.display().to_string());
                }
                Err(e) => warn!(file = %path.display(), error = %e, "could not move completed email"),
            }
        }

        info!(
            file = %path.display(),
            fingerprint = record.short_fingerprint(),
            mechanisms = metadata.unsubscribe.len(),
            companies = metadata.company_matches.len(),
            reports = metadata.reports.len(),
            "completed"
        );
        Ok(ProcessedEmail {
            state: EmailState::Completed,
            transitions,
            metadata,
        })
    }

    fn fail(
        &self,
        path: &Path,
        fingerprint: String,
        format: Option<EmailFormat>,
        error: SweepError,
    ) -> Result<ProcessedEmail> {
        warn!(file = %path.display(), error = %error, "email failed, left in place");
        let target = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        if self
            .ledger
            .claim(&fingerprint, ActionType::NormalizeFailed, &target)
        {
            self.ledger.record(
                &fingerprint,
                ActionType::NormalizeFailed,
                &target,
                ActionStatus::Failed,
                Some(error.to_string()),
            )?;
        }
        Ok(ProcessedEmail {
            state: EmailState::Failed,
            transitions: vec![EmailState::Received, EmailState::Failed],
            metadata: MetadataRecord::failed(fingerprint, path, format, &error),
        })
    }

    async fn unsubscribe_stage(&self, record: &EmailRecord) -> Result<Vec<MechanismResult>> {
        let mut results = Vec::new();
        // header mechanisms come first; attempts are sequential
        for mechanism in self.resolver.extract(record) {
            // nothing was attempted, so nothing is claimed or recorded
            if !self.options.auto_unsubscribe {
                results.push(MechanismResult::skipped(mechanism, "auto-unsubscribe disabled"));
                continue;
            }
            if !self.ledger.claim(
                &record.fingerprint,
                ActionType::UnsubscribeAttempt,
                &mechanism.target,
            ) {
                debug!(target = %mechanism.target, "unsubscribe already attempted");
                results.push(MechanismResult::skipped(mechanism, "already attempted"));
                continue;
            }
            let result = self.resolver.attempt(&mechanism).await;
            let status = match result.outcome {
                AttemptOutcome::Success => ActionStatus::Success,
                AttemptOutcome::Failure | AttemptOutcome::Timeout => ActionStatus::Failure,
                AttemptOutcome::Skipped => ActionStatus::Skipped,
            };
            self.ledger.record(
                &record.fingerprint,
                ActionType::UnsubscribeAttempt,
                &result.mechanism.target,
                status,
                Some(result.detail()),
            )?;
            results.push(result);
        }
        Ok(results)
    }

    async fn domain_stage(&self, record: &EmailRecord) -> Result<Option<DomainRecord>> {
        let Some(domain) = record.sender_domain.as_deref() else {
            return Ok(None);
        };
        let found = self.intel.lookup(domain).await;
        if self
            .ledger
            .claim(&record.fingerprint, ActionType::WhoisLookup, &found.domain)
        {
            let (status, detail) = match &found.error {
                None => (
                    ActionStatus::Resolved,
                    format!(
                        "registrar={} abuse={}",
                        found.registrar.as_deref().unwrap_or("-"),
                        found.abuse_contact.as_deref().unwrap_or("-")
                    ),
                ),
                Some(e) => (ActionStatus::Unresolved, e.clone()),
            };
            self.ledger.record(
                &record.fingerprint,
                ActionType::WhoisLookup,
                &found.domain,
                status,
                Some(detail),
            )?;
        }
        Ok(Some(found))
    }

    async fn company_stage(&self, record: &EmailRecord) -> Result<Vec<CompanyMatch>> {
        let matches = self.matcher.match_record(record);
        for m in &matches {
            if self
                .ledger
                .claim(&record.fingerprint, ActionType::CompanyMatch, &m.company)
            {
                self.ledger.record(
                    &record.fingerprint,
                    ActionType::CompanyMatch,
                    &m.company,
                    ActionStatus::Matched,
                    Some(format!("term={} contact={}", m.matched_term, m.abuse_contact)),
                )?;
            }
        }
        Ok(matches)
    }

    fn report_stage(
        &self,
        record: &EmailRecord,
        domain: Option<&DomainRecord>,
        matches: &[CompanyMatch],
        original: &Path,
    ) -> Result<Vec<ReportRef>> {
        let mut prepared = Vec::new();
        if self.options.authority_reporting {
            prepared.extend(authority_reports(record, domain, Some(original)));
        }
        if self.options.company_reporting {
            prepared.extend(company_reports(record, matches, Some(original)));
        }

        let mut refs = Vec::new();
        for report in prepared {
            if !self.ledger.claim(
                &record.fingerprint,
                ActionType::ReportPrepared,
                &report.recipient,
            ) {
                continue;
            }
            let path = match self.reports.save(&report) {
                Ok(p) => p,
                Err(e) => {
                    warn!(recipient = %report.recipient, error = %e, "could not write report");
                    continue;
                }
            };
            self.ledger.record(
                &record.fingerprint,
                ActionType::ReportPrepared,
                &report.recipient,
                ActionStatus::Prepared,
                Some(path.display().to_string()),
            )?;
            refs.push(ReportRef::from(&report));
        }
        Ok(refs)
    }
}
