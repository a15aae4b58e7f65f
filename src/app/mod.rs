//! Batch driver.
//!
//! `App::run` is what the binary calls:
//!   1. Open the run context (ledger, per-run files)
//!   2. Scan the consume directory for `.eml` / `.msg` files
//!   3. Drive every file through the pipeline, `max_concurrent_emails` at a time
//!   4. Append each metadata record as it completes
//!   5. Fold the run into today's summary
//!   6. Render JSON, YAML or the styled summary
//!
//! An operator interrupt stops the batch between files; entries already in
//! the ledger stay where they are. A fatal error (ledger write) stops the
//! batch and propagates.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::errors::{IoResultExt, Result, SweepError};
use crate::ledger::{ActionLedger, new_run_id};
use crate::normalize::EmailFormat;
use crate::pipeline::{EmailState, Pipeline};
use crate::structured_output::{DailySummary, MetadataRecord, OutputFiles, RunOutput, RunTotals};
use crate::styled_output::StyledFormatter;

/// Exit code used when the operator interrupted the batch.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Everything a run writes besides the reports.
pub struct RunContext {
    pub run_id: String,
    pub ledger: Arc<ActionLedger>,
    pub files: OutputFiles,
    logs_dir: PathBuf,
    metadata_path: PathBuf,
}

impl RunContext {
    /// Create the logs directory and open the durable ledger with its
    /// per-run mirror.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_id(config, new_run_id())
    }

    pub fn open_with_id(config: &Config, run_id: String) -> Result<Self> {
        let logs_dir = config.directories.logs.clone();
        std::fs::create_dir_all(&logs_dir)
            .with_path(logs_dir.display().to_string(), "create logs directory")?;

        let ledger_path = config.ledger_path();
        let actions_path = logs_dir.join(format!("actions_taken_{run_id}.jsonl"));
        let metadata_path = logs_dir.join(format!("email_metadata_{run_id}.jsonl"));
        let ledger = ActionLedger::open(
            &ledger_path,
            Some(&actions_path),
            run_id.clone(),
            !config.processing.reprocess,
        )
        .map_err(|e| match e {
            SweepError::Io { source, .. } => {
                SweepError::ledger_write(ledger_path.display().to_string(), source)
            }
            other => other,
        })?;

        let files = OutputFiles {
            ledger: ledger_path.display().to_string(),
            actions_taken: actions_path.display().to_string(),
            email_metadata: metadata_path.display().to_string(),
            summary: String::new(),
            reports_dir: config.reports_dir().display().to_string(),
        };
        info!(run_id = %run_id, ledger = %ledger_path.display(), "run started");
        Ok(Self {
            run_id,
            ledger: Arc::new(ledger),
            files,
            logs_dir,
            metadata_path,
        })
    }
}

/// `.eml` / `.msg` files directly inside `dir`, sorted by name.
pub fn scan_consume_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(SweepError::configuration(format!(
            "consume directory '{}' does not exist",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_path(dir.display().to_string(), "list consume directory")?;
    for entry in entries {
        let path = entry
            .with_path(dir.display().to_string(), "list consume directory")?
            .path();
        if !path.is_file() {
            continue;
        }
        if EmailFormat::from_path(&path).is_some() {
            files.push(path);
        } else {
            debug!(file = %path.display(), "ignoring non-email file");
        }
    }
    files.sort();
    Ok(files)
}

/// Appends one JSON line per email and flushes it.
struct MetadataWriter {
    path: PathBuf,
    file: File,
}

impl MetadataWriter {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_path(path.display().to_string(), "open metadata file")?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, record: &MetadataRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")
            .and_then(|_| self.file.flush())
            .with_path(self.path.display().to_string(), "write metadata")
    }
}

/// Run every file in the consume directory through `pipeline`.
///
/// `shutdown` resolving stops the batch before the next file completes.
pub async fn run_batch<S>(
    config: &Config,
    ctx: &RunContext,
    pipeline: &Pipeline,
    shutdown: S,
) -> Result<RunOutput>
where
    S: Future<Output = ()>,
{
    let files = scan_consume_dir(&config.directories.consume)?;
    info!(
        consume = %config.directories.consume.display(),
        files = files.len(),
        jobs = config.processing.max_concurrent_emails,
        "scanning complete"
    );

    let mut totals = RunTotals {
        files_found: files.len() as u64,
        ..Default::default()
    };
    let mut summary = DailySummary::today(&ctx.logs_dir)?;
    summary.add_run(&ctx.run_id);
    let mut writer = MetadataWriter::create(&ctx.metadata_path)?;
    let mut emails = Vec::with_capacity(files.len());

    let mut results = futures::stream::iter(files.iter().map(|path| pipeline.process_file(path)))
        .buffer_unordered(config.processing.max_concurrent_emails.max(1));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!(run_id = %ctx.run_id, "interrupted, stopping batch");
                totals.interrupted = true;
                break;
            }
            next = results.next() => {
                let Some(result) = next else { break };
                let processed = match result {
                    Ok(processed) => processed,
                    Err(e) => {
                        error!(error = %e, category = %e.category(), "batch stopped");
                        if let Err(save_err) = summary.save(&ctx.logs_dir) {
                            warn!(error = %save_err, "could not save daily summary");
                        }
                        return Err(e);
                    }
                };
                let record = processed.metadata;
                writer.append(&record)?;
                summary.absorb(&record);
                tally(&mut totals, &record);
                emails.push(record);
            }
        }
    }
    drop(results);

    let summary_path = summary.save(&ctx.logs_dir)?;
    let mut output_files = ctx.files.clone();
    output_files.summary = summary_path.display().to_string();

    info!(
        run_id = %ctx.run_id,
        completed = totals.completed,
        failed = totals.failed,
        reports = totals.reports_prepared,
        whois_queries = pipeline.intel().queries(),
        "run finished"
    );

    Ok(RunOutput {
        tool_name: crate::NAME.to_string(),
        version: crate::VERSION.to_string(),
        run_id: ctx.run_id.clone(),
        generated_at: chrono::Utc::now(),
        totals,
        emails,
        daily_summary: summary,
        files: output_files,
    })
}

fn tally(totals: &mut RunTotals, record: &MetadataRecord) {
    use crate::unsubscribe::AttemptOutcome;

    match record.state {
        EmailState::Failed => totals.failed += 1,
        _ => totals.completed += 1,
    }
    if record.moved_to.is_some() {
        totals.moved += 1;
    }
    for m in &record.unsubscribe {
        match m.outcome {
            AttemptOutcome::Success => totals.unsubscribe_successes += 1,
            AttemptOutcome::Failure | AttemptOutcome::Timeout => totals.unsubscribe_failures += 1,
            AttemptOutcome::Skipped => {}
        }
    }
    totals.reports_prepared += record.reports.len() as u64;
}

/// Resolves on Ctrl-C; never resolves where signals are unavailable.
pub async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Application façade.
pub struct App;

impl App {
    /// File, then environment, then CLI; validated.
    pub fn load_config(cli: &Cli) -> Result<Config> {
        let mut config = Config::load(cli.config.as_deref())?;
        config.apply_env()?;
        config.merge_with_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Print the metadata schema if asked. Returns whether it did.
    pub fn maybe_print_schema(cli: &Cli) -> Result<bool> {
        if !cli.generate_schema {
            return Ok(false);
        }
        println!("{}", MetadataRecord::generate_json_schema()?);
        Ok(true)
    }

    /// Execute one batch with production networking.
    ///
    /// Returns: intended process exit code.
    pub async fn run(cli: &Cli, config: &Config) -> Result<i32> {
        let ctx = RunContext::open(config)?;
        let pipeline = Pipeline::from_config(config, Arc::clone(&ctx.ledger))?;
        let output = run_batch(config, &ctx, &pipeline, interrupt_signal()).await?;
        Self::render(cli, &output)?;
        Ok(if output.totals.interrupted {
            EXIT_INTERRUPTED
        } else {
            0
        })
    }

    fn render(cli: &Cli, output: &RunOutput) -> Result<()> {
        if cli.json {
            println!("{}", output.to_json()?);
        } else if cli.yaml {
            println!("{}", output.to_yaml()?);
        } else {
            let formatter = if cli.no_color {
                StyledFormatter::without_colors()
            } else {
                StyledFormatter::new()
            };
            formatter
                .print_run(output)
                .map_err(|e| SweepError::io("stdout", "print summary", e))?;
        }
        Ok(())
    }
}
