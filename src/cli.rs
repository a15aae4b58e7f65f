use std::path::PathBuf;

use clap::Parser;

/// Command-line interface definition.
///
/// Verbosity levels:
/// 0 - errors only
/// 1 - warnings (default)
/// 2 - progress (info)
/// 5 - trace/debug
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "spamsweep",
    author,
    version,
    about = "Process spam emails: unsubscribe, look up the sender domain, and prepare abuse reports"
)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to ./spamsweep.toml when present.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory with incoming .eml / .msg files
    #[arg(long, value_name = "DIR")]
    pub consume_dir: Option<PathBuf>,

    /// Directory completed files are moved to
    #[arg(long, value_name = "DIR")]
    pub processed_dir: Option<PathBuf>,

    /// Directory for the ledger, metadata, summaries, reports and logs
    #[arg(long, value_name = "DIR")]
    pub logs_dir: Option<PathBuf>,

    /// Tries per unsubscribe mechanism
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// HTTP request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Emails processed concurrently
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Extract unsubscribe mechanisms but do not contact them
    #[arg(long)]
    pub no_unsubscribe: bool,

    /// Do not prepare authority / registrar reports
    #[arg(long)]
    pub no_authority_reports: bool,

    /// Do not prepare reports to impersonated companies
    #[arg(long)]
    pub no_company_reports: bool,

    /// Ignore actions recorded by previous runs
    #[arg(long)]
    pub reprocess: bool,

    /// Leave completed files in the consume directory
    #[arg(long)]
    pub keep_files: bool,

    /// Verbosity level (0,1,2,5)
    #[arg(long, default_value_t = 1)]
    pub verbose: u8,

    /// Print the run as JSON
    #[arg(long, conflicts_with = "yaml")]
    pub json: bool,

    /// Print the run as YAML
    #[arg(long, conflicts_with = "json")]
    pub yaml: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Print the JSON schema of the metadata record and exit
    #[arg(long)]
    pub generate_schema: bool,
}

impl Cli {
    /// Parse CLI arguments from process args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Convenience: are we in very verbose/debug mode?
    pub fn is_trace(&self) -> bool {
        self.verbose >= 5
    }

    /// Machine-readable output requested?
    pub fn structured(&self) -> bool {
        self.json || self.yaml
    }

    /// `tracing` filter directive for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "error",
            1 => "warn",
            2..=4 => "info",
            _ => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["spamsweep"]);
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.log_filter(), "warn");
        assert!(!cli.structured());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "spamsweep",
            "--consume-dir",
            "in",
            "--max-attempts",
            "5",
            "-j",
            "4",
            "--no-unsubscribe",
            "--keep-files",
            "--json",
            "--verbose",
            "5",
        ]);
        assert_eq!(cli.consume_dir, Some(PathBuf::from("in")));
        assert_eq!(cli.max_attempts, Some(5));
        assert_eq!(cli.jobs, Some(4));
        assert!(cli.no_unsubscribe && cli.keep_files && cli.json);
        assert!(cli.is_trace());
        assert_eq!(cli.log_filter(), "debug");
    }

    #[test]
    fn test_json_and_yaml_conflict() {
        assert!(Cli::try_parse_from(["spamsweep", "--json", "--yaml"]).is_err());
    }
}
