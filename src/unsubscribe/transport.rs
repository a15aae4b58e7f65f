//! HTTP side of unsubscribing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use thiserror::Error;

use crate::errors::{Result, SweepError};

/// Maximum redirects followed before a fetch counts as failed.
pub const MAX_REDIRECTS: usize = 5;

/// RFC 8058 form body for one-click requests.
pub const ONE_CLICK_BODY: &str = "List-Unsubscribe=One-Click";

/// Why one HTTP request produced no status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connect(String),
    #[error("redirect error: {0}")]
    Redirect(String),
    #[error("request error: {0}")]
    Other(String),
}

impl TransportError {
    /// Short label stored in ledger details.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Redirect(_) => "redirect",
            TransportError::Other(_) => "request",
        }
    }
}

/// Performs one unsubscribe request and returns the final HTTP status
/// after redirects.
#[async_trait]
pub trait UnsubscribeTransport: Send + Sync {
    async fn fetch(&self, url: &str, one_click: bool) -> std::result::Result<u16, TransportError>;
}

/// `reqwest`-backed transport: GET for plain links, form POST for one-click.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("spamsweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SweepError::internal_with("failed to build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UnsubscribeTransport for ReqwestTransport {
    async fn fetch(&self, url: &str, one_click: bool) -> std::result::Result<u16, TransportError> {
        let request = if one_click {
            self.client
                .post(url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(ONE_CLICK_BODY)
        } else {
            self.client.get(url)
        };
        let response = request.send().await.map_err(classify)?;
        Ok(response.status().as_u16())
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_redirect() {
        TransportError::Redirect(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
