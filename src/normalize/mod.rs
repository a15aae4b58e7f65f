//! Email normalization: raw `.eml` / `.msg` bytes → `EmailRecord`.
//!
//! Each container format has its own `Normalizer`; both produce the same
//! `ParsedParts`, which `EmailRecord::assemble` turns into the immutable
//! record every later stage consumes. Parsing is a pure transform.

mod eml;
mod msg;

use std::fmt;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::emails::{address_domain, extract_address};
use crate::errors::Result;

pub use eml::EmlNormalizer;
pub use msg::MsgNormalizer;

/// Supported input containers, dispatched on file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailFormat {
    /// RFC 5322 text message
    Eml,
    /// Outlook compound-file message
    Msg,
}

impl EmailFormat {
    /// Infer the format from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "eml" => Some(EmailFormat::Eml),
            "msg" => Some(EmailFormat::Msg),
            _ => None,
        }
    }

    /// The normalizer implementation for this format.
    pub fn normalizer(self) -> &'static dyn Normalizer {
        match self {
            EmailFormat::Eml => &EmlNormalizer,
            EmailFormat::Msg => &MsgNormalizer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmailFormat::Eml => "eml",
            EmailFormat::Msg => "msg",
        }
    }
}

impl fmt::Display for EmailFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common capability of every container parser.
pub trait Normalizer: Send + Sync {
    fn format(&self) -> EmailFormat;

    /// Decode the container into its parts. Fails with `SweepError::Parse`
    /// for malformed, truncated or undecodable input.
    fn parse_parts(&self, bytes: &[u8]) -> Result<ParsedParts>;

    fn parse(&self, bytes: &[u8]) -> Result<EmailRecord> {
        let parts = self.parse_parts(bytes)?;
        Ok(EmailRecord::assemble(self.format(), parts))
    }
}

/// Parse `bytes` with the normalizer for `format`.
pub fn normalize(format: EmailFormat, bytes: &[u8]) -> Result<EmailRecord> {
    format.normalizer().parse(bytes)
}

/// Fingerprint used when a file cannot be normalized at all.
pub fn raw_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// One header field, value unfolded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Ordered, multi-valued header list with case-insensitive lookup.
/// Duplicate names are kept in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct HeaderMap {
    fields: Vec<HeaderField>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw header block (everything before the first blank line),
    /// unfolding continuation lines per RFC 5322 §2.2.3.
    pub fn parse_block(raw: &str) -> Self {
        let mut fields: Vec<HeaderField> = Vec::new();
        for line in raw.lines() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = fields.last_mut() {
                    if !last.value.is_empty() {
                        last.value.push(' ');
                    }
                    last.value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if is_field_name(name) {
                    fields.push(HeaderField {
                        name: name.to_string(),
                        value: value.trim().to_string(),
                    });
                }
            }
        }
        Self { fields }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// Every value for `name`, in message order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// RFC 5322 field-name: printable ASCII except ':' and space.
fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

/// Attachment metadata only; contents are never decoded further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// What a container parser hands back before the record is assembled.
#[derive(Debug, Clone, Default)]
pub struct ParsedParts {
    pub headers: HeaderMap,
    /// Decoded `Subject` (RFC 2047 words resolved), when the container
    /// provides one separately from the raw header.
    pub subject: Option<String>,
    /// Sender address when the container stores it outside the headers.
    pub sender: Option<String>,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Canonical, immutable representation of one input email.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailRecord {
    pub fingerprint: String,
    pub format: EmailFormat,
    /// Bare sender address, empty when `From` is missing
    pub sender: String,
    /// Lowercased domain of the sender address
    pub sender_domain: Option<String>,
    /// Empty when `Subject` is missing
    pub subject: String,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub headers: HeaderMap,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

impl EmailRecord {
    pub fn assemble(format: EmailFormat, parts: ParsedParts) -> Self {
        let ParsedParts {
            headers,
            subject,
            sender,
            text_body,
            html_body,
            attachments,
        } = parts;

        let from_header = headers.get("From").unwrap_or("").to_string();
        let sender = sender
            .filter(|s| !s.trim().is_empty())
            .or_else(|| extract_address(&from_header))
            .unwrap_or_default()
            .trim()
            .to_string();
        let sender_domain = address_domain(&sender);
        let subject = subject
            .or_else(|| headers.get("Subject").map(str::to_string))
            .unwrap_or_default()
            .trim()
            .to_string();
        let date = headers.get("Date").map(str::to_string);
        let message_id = headers.get("Message-ID").map(str::to_string);

        let fingerprint = fingerprint(
            &from_header,
            &subject,
            date.as_deref(),
            message_id.as_deref(),
            &text_body,
            html_body.as_deref(),
        );

        Self {
            fingerprint,
            format,
            sender,
            sender_domain,
            subject,
            date,
            message_id,
            headers,
            text_body,
            html_body,
            attachments,
        }
    }

    /// Short form used in file names and log lines.
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }

    /// `Received` headers, top (most recent) first.
    pub fn received(&self) -> Vec<&str> {
        self.headers.get_all("Received")
    }
}

/// Stable digest over From, Subject, Date, Message-ID and both bodies.
fn fingerprint(
    from: &str,
    subject: &str,
    date: Option<&str>,
    message_id: Option<&str>,
    text_body: &str,
    html_body: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"from:");
    hasher.update(from.trim().to_lowercase().as_bytes());
    hasher.update(b"\nsubject:");
    hasher.update(subject.trim().as_bytes());
    hasher.update(b"\ndate:");
    hasher.update(date.unwrap_or("").trim().as_bytes());
    hasher.update(b"\nmessage-id:");
    hasher.update(message_id.unwrap_or("").trim().as_bytes());
    hasher.update(b"\n\ntext:");
    hasher.update(canonical_body(text_body).as_bytes());
    hasher.update(b"\n\nhtml:");
    hasher.update(canonical_body(html_body.unwrap_or("")).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Split raw message text at the end of its header block.
pub(crate) fn split_header_block(text: &str) -> (&str, &str) {
    if let Some(pos) = text.find("\r\n\r\n") {
        let lf = text.find("\n\n");
        match lf {
            Some(lf_pos) if lf_pos < pos => (&text[..lf_pos], &text[lf_pos + 2..]),
            _ => (&text[..pos], &text[pos + 4..]),
        }
    } else if let Some(pos) = text.find("\n\n") {
        (&text[..pos], &text[pos + 2..])
    } else {
        (text, "")
    }
}
