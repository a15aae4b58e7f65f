//! Configuration management for spamsweep.
//!
//! Configuration is layered: TOML file (or defaults), then environment
//! variables, then command-line flags. The result is validated once at
//! startup; any error there halts the batch before a file is touched.
//! The finished `Config` is handed to each component explicitly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Default file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "spamsweep.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input / output directories
    pub directories: DirectoryConfig,

    /// Retry, timeout and batch settings
    #[serde(alias = "processing_settings")]
    pub processing: ProcessingConfig,

    /// Feature toggles
    pub features: FeatureConfig,

    /// Extra company → abuse contact pairs, merged over the built-in table
    pub additional_company_contacts: BTreeMap<String, String>,
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Where new `.eml` / `.msg` files are dropped
    pub consume: PathBuf,

    /// Where completed files are moved
    pub processed: PathBuf,

    /// Ledger, metadata, summaries, reports and log files
    pub logs: PathBuf,
}

/// Processing options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Tries per unsubscribe mechanism (including the first)
    pub max_unsubscribe_attempts: u32,

    /// Per-request HTTP timeout in seconds
    #[serde(alias = "request_timeout")]
    pub request_timeout_secs: u64,

    /// Per-query WHOIS timeout in seconds
    pub whois_timeout_secs: u64,

    /// First backoff delay between retries
    pub retry_initial_delay_ms: u64,

    /// Upper bound for the backoff delay
    pub retry_max_delay_ms: u64,

    /// Maximum registry → registrar WHOIS referral hops
    pub max_whois_referrals: usize,

    /// Emails processed in parallel
    pub max_concurrent_emails: usize,

    /// Files larger than this are rejected before parsing
    pub max_file_size_bytes: u64,

    /// Move completed files to the processed directory
    pub move_processed: bool,

    /// Ignore ledger history from previous runs
    pub reprocess: bool,
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub auto_unsubscribe: bool,

    #[serde(alias = "report_to_authorities")]
    pub authority_reporting: bool,

    #[serde(alias = "report_to_companies")]
    pub company_reporting: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            consume: PathBuf::from("consume"),
            processed: PathBuf::from("processed"),
            logs: PathBuf::from("logs"),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_unsubscribe_attempts: 3,
            request_timeout_secs: 10,
            whois_timeout_secs: 10,
            retry_initial_delay_ms: 250,
            retry_max_delay_ms: 5_000,
            max_whois_referrals: 3,
            max_concurrent_emails: 1,
            max_file_size_bytes: 50 * 1024 * 1024, // 50MB
            move_processed: true,
            reprocess: false,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            auto_unsubscribe: true,
            authority_reporting: true,
            company_reporting: true,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.as_ref().display(), "Loaded config");
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            format: "TOML".to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolve the file layer: an explicit path must exist, the default
    /// `spamsweep.toml` is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Overlay environment variables onto this configuration.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<u32>("SPAMSWEEP_MAX_UNSUBSCRIBE_ATTEMPTS")? {
            self.processing.max_unsubscribe_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("SPAMSWEEP_REQUEST_TIMEOUT_SECS")? {
            self.processing.request_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("SPAMSWEEP_WHOIS_TIMEOUT_SECS")? {
            self.processing.whois_timeout_secs = v;
        }
        if let Ok(dir) = std::env::var("SPAMSWEEP_CONSUME_DIR") {
            self.directories.consume = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SPAMSWEEP_PROCESSED_DIR") {
            self.directories.processed = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SPAMSWEEP_LOGS_DIR") {
            self.directories.logs = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Merge with CLI arguments, giving CLI precedence
    pub fn merge_with_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(ref dir) = cli.consume_dir {
            self.directories.consume = dir.clone();
        }
        if let Some(ref dir) = cli.processed_dir {
            self.directories.processed = dir.clone();
        }
        if let Some(ref dir) = cli.logs_dir {
            self.directories.logs = dir.clone();
        }
        if let Some(n) = cli.max_attempts {
            self.processing.max_unsubscribe_attempts = n;
        }
        if let Some(secs) = cli.timeout {
            self.processing.request_timeout_secs = secs;
        }
        if let Some(jobs) = cli.jobs {
            self.processing.max_concurrent_emails = jobs;
        }
        if cli.no_unsubscribe {
            self.features.auto_unsubscribe = false;
        }
        if cli.no_authority_reports {
            self.features.authority_reporting = false;
        }
        if cli.no_company_reports {
            self.features.company_reporting = false;
        }
        if cli.reprocess {
            self.processing.reprocess = true;
        }
        if cli.keep_files {
            self.processing.move_processed = false;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.max_unsubscribe_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing.max_unsubscribe_attempts".to_string(),
                value: "0".to_string(),
                reason: "At least one attempt is required".to_string(),
            });
        }

        if self.processing.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing.request_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.processing.whois_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing.whois_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.processing.max_concurrent_emails == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing.max_concurrent_emails".to_string(),
                value: "0".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        if self.processing.max_file_size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing.max_file_size_bytes".to_string(),
                value: "0".to_string(),
                reason: "Max file size must be greater than 0".to_string(),
            });
        }

        for (dir, field) in [
            (&self.directories.consume, "directories.consume"),
            (&self.directories.processed, "directories.processed"),
            (&self.directories.logs, "directories.logs"),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: field.to_string(),
                });
            }
        }

        for (company, contact) in &self.additional_company_contacts {
            if company.trim().is_empty() || !crate::emails::is_plausible_email(contact) {
                return Err(ConfigError::InvalidValue {
                    field: format!("additional_company_contacts.{company}"),
                    value: contact.clone(),
                    reason: "Expected a company name mapped to an email address".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.request_timeout_secs)
    }

    pub fn whois_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.whois_timeout_secs)
    }

    /// Retry policy for unsubscribe HTTP attempts.
    pub fn unsubscribe_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.processing.max_unsubscribe_attempts,
            attempt_timeout: self.request_timeout(),
            initial_delay: Duration::from_millis(self.processing.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.processing.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    /// Retry policy for WHOIS queries (each server query is retried once).
    pub fn whois_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            attempt_timeout: self.whois_timeout(),
            initial_delay: Duration::from_millis(self.processing.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.processing.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.directories.logs.join("action_ledger.jsonl")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.directories.logs.join("reports")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: "Not a valid number".to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration-related errors
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse configuration format
    Parse { format: String, reason: String },

    /// Invalid configuration value
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Missing required configuration
    MissingRequired { field: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead { path, source } => {
                write!(f, "Failed to read config file '{}': {}", path, source)
            }
            ConfigError::Parse { format, reason } => {
                write!(f, "Failed to parse {} config: {}", format, reason)
            }
            ConfigError::InvalidValue {
                field,
                value,
                reason,
            } => {
                write!(f, "Invalid value '{}' for '{}': {}", value, field, reason)
            }
            ConfigError::MissingRequired { field } => {
                write!(f, "Missing required configuration field: {}", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead { source, .. } => Some(source),
            _ => None,
        }
    }
}
