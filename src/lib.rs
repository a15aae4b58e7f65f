//! Spamsweep Library
//!
//! Batch processing for locally stored spam and phishing emails. Each
//! `.eml` / `.msg` file is:
//!
//! - Normalized into a fingerprinted [`EmailRecord`]
//! - Scanned for unsubscribe mechanisms, which are attempted under a
//!   bounded retry policy
//! - Attributed to a registrable domain whose WHOIS data is resolved once
//!   per run
//! - Matched against known brand signatures
//! - Turned into prepared abuse reports
//!
//! Every action lands in an append-only [`ActionLedger`] so repeated runs
//! never repeat an unsubscribe or a report.
//!
//! # Example
//!
//! ```rust,no_run
//! use spamsweep::normalize::{EmailFormat, normalize};
//! use spamsweep::unsubscribe::extract_mechanisms;
//!
//! let bytes = std::fs::read("message.eml")?;
//! let record = normalize(EmailFormat::Eml, &bytes)?;
//! for mechanism in extract_mechanisms(&record) {
//!     println!("{} {}", mechanism.kind, mechanism.target);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod app;
pub mod cli;
pub mod companies;
pub mod config;
pub mod domain_utils;
pub mod emails;
pub mod errors;
pub mod ledger;
pub mod normalize;
pub mod pipeline;
pub mod reports;
pub mod retry;
pub mod structured_output;
pub mod styled_output;
pub mod unsubscribe;
pub mod whois;

// Re-export commonly used types and functions for convenience
pub use companies::{CompanyMatch, CompanyMatcher};
pub use config::Config;
pub use errors::{Result, SweepError};
pub use ledger::{ActionLedger, ActionStatus, ActionType, LedgerEntry};
pub use normalize::{EmailFormat, EmailRecord, Normalizer};
pub use pipeline::{EmailState, Pipeline};
pub use unsubscribe::{UnsubscribeMechanism, UnsubscribeResolver};
pub use whois::{DomainIntel, DomainRecord, WhoisClient};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
