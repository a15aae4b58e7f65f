//! Append-only action ledger.
//!
//! Every action taken for an email is one JSON line in
//! `action_ledger.jsonl` (kept across runs) and in the run's
//! `actions_taken_<run-id>.jsonl`. Lines are flushed as they are written,
//! so an interrupted batch never loses entries for finished emails.
//!
//! `claim` is the idempotence gate: it succeeds once per
//! (fingerprint, action, target) across the loaded history and the current
//! run, atomically per key.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Result, SweepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    UnsubscribeAttempt,
    WhoisLookup,
    CompanyMatch,
    ReportPrepared,
    ReportSent,
    NormalizeFailed,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionType::UnsubscribeAttempt => "unsubscribe-attempt",
            ActionType::WhoisLookup => "whois-lookup",
            ActionType::CompanyMatch => "company-match",
            ActionType::ReportPrepared => "report-prepared",
            ActionType::ReportSent => "report-sent",
            ActionType::NormalizeFailed => "normalize-failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Skipped,
    Resolved,
    Unresolved,
    Matched,
    Prepared,
    Sent,
    Failed,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Success => "success",
            ActionStatus::Failure => "failure",
            ActionStatus::Skipped => "skipped",
            ActionStatus::Resolved => "resolved",
            ActionStatus::Unresolved => "unresolved",
            ActionStatus::Matched => "matched",
            ActionStatus::Prepared => "prepared",
            ActionStatus::Sent => "sent",
            ActionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LedgerEntry {
    pub run_id: String,
    pub fingerprint: String,
    pub action: ActionType,
    pub target: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn key(&self) -> ActionKey {
        ActionKey::new(&self.fingerprint, self.action, &self.target)
    }
}

/// Idempotence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub fingerprint: String,
    pub action: ActionType,
    pub target: String,
}

impl ActionKey {
    pub fn new(fingerprint: &str, action: ActionType, target: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            action,
            target: target.to_string(),
        }
    }
}

/// Fresh identifier for one invocation, sortable by start time.
pub fn new_run_id() -> String {
    use rand::Rng;
    let suffix: u16 = rand::rng().random();
    format!("{}-{suffix:04x}", Utc::now().format("%Y%m%dT%H%M%S"))
}

struct Sinks {
    durable: File,
    run: Option<File>,
}

pub struct ActionLedger {
    run_id: String,
    path: PathBuf,
    history: HashSet<ActionKey>,
    claimed: DashSet<ActionKey>,
    entries: Mutex<Vec<LedgerEntry>>,
    sinks: Mutex<Sinks>,
}

impl ActionLedger {
    /// Open (creating if needed) the durable ledger at `path` and, when
    /// given, the per-run mirror at `run_path`. With `honor_history`
    /// false, keys from earlier runs do not block new attempts.
    pub fn open(
        path: &Path,
        run_path: Option<&Path>,
        run_id: impl Into<String>,
        honor_history: bool,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let loaded = load_entries(path)?;
        let history = if honor_history {
            loaded.iter().map(LedgerEntry::key).collect()
        } else {
            HashSet::new()
        };
        debug!(
            path = %path.display(),
            entries = loaded.len(),
            honor_history,
            "ledger loaded"
        );

        let durable = open_append(path)?;
        let run = run_path.map(open_append).transpose()?;

        Ok(Self {
            run_id,
            path: path.to_path_buf(),
            history,
            claimed: DashSet::new(),
            entries: Mutex::new(loaded),
            sinks: Mutex::new(Sinks { durable, run }),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an entry already exists for this triple in scope.
    pub fn has_attempted(&self, fingerprint: &str, action: ActionType, target: &str) -> bool {
        let key = ActionKey::new(fingerprint, action, target);
        self.history.contains(&key) || self.claimed.contains(&key)
    }

    /// Reserve the triple for this caller. Returns false if it was already
    /// attempted or claimed; at most one concurrent caller wins.
    pub fn claim(&self, fingerprint: &str, action: ActionType, target: &str) -> bool {
        let key = ActionKey::new(fingerprint, action, target);
        if self.history.contains(&key) {
            return false;
        }
        self.claimed.insert(key)
    }

    /// Append one entry and flush it to disk before returning.
    pub fn record(
        &self,
        fingerprint: &str,
        action: ActionType,
        target: &str,
        status: ActionStatus,
        detail: Option<String>,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            run_id: self.run_id.clone(),
            fingerprint: fingerprint.to_string(),
            action,
            target: target.to_string(),
            status,
            detail,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        {
            let mut sinks = self
                .sinks
                .lock()
                .map_err(|_| SweepError::internal("ledger writer lock poisoned"))?;
            write_line(&mut sinks.durable, &line)
                .map_err(|e| SweepError::ledger_write(self.path.display().to_string(), e))?;
            if let Some(run) = sinks.run.as_mut() {
                write_line(run, &line).map_err(|e| {
                    SweepError::ledger_write(format!("actions_taken ({})", self.run_id), e)
                })?;
            }
        }

        self.claimed.insert(entry.key());
        self.entries
            .lock()
            .map_err(|_| SweepError::internal("ledger index lock poisoned"))?
            .push(entry.clone());
        debug!(
            fingerprint = %&entry.fingerprint[..entry.fingerprint.len().min(12)],
            action = %entry.action,
            target = %entry.target,
            status = %entry.status,
            "ledger append"
        );
        Ok(entry)
    }

    /// Snapshot of every known entry, history first.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Entries appended by this run.
    pub fn run_entries(&self) -> Vec<LedgerEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.run_id == self.run_id)
            .collect()
    }

    /// `report-prepared` entries without a successful `report-sent`.
    pub fn pending_reports(&self) -> Vec<LedgerEntry> {
        let entries = self.entries();
        let sent: HashSet<(String, String)> = entries
            .iter()
            .filter(|e| e.action == ActionType::ReportSent && e.status == ActionStatus::Sent)
            .map(|e| (e.fingerprint.clone(), e.target.clone()))
            .collect();
        let mut seen = HashSet::new();
        entries
            .into_iter()
            .filter(|e| e.action == ActionType::ReportPrepared && e.status == ActionStatus::Prepared)
            .filter(|e| !sent.contains(&(e.fingerprint.clone(), e.target.clone())))
            .filter(|e| seen.insert((e.fingerprint.clone(), e.target.clone())))
            .collect()
    }
}

fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.flush()?;
    file.sync_data()
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SweepError::ledger_write(parent.display().to_string(), e))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SweepError::ledger_write(path.display().to_string(), e))
}

/// Read a JSONL ledger; malformed lines are skipped with a warning.
pub fn load_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| SweepError::io(path.display().to_string(), "read ledger", e))?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SweepError::io(path.display().to_string(), "read ledger", e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed ledger line"),
        }
    }
    Ok(entries)
}
