//! RFC 5322 / MIME messages (`.eml`).
//!
//! Headers are read from the raw block so duplicates and order survive;
//! MIME structure, transfer decoding and charsets are left to `mail-parser`.

use encoding_rs::WINDOWS_1252;
use mail_parser::{MessageParser, MimeHeaders, PartType};

use super::{AttachmentInfo, EmailFormat, HeaderMap, Normalizer, ParsedParts, split_header_block};
use crate::errors::{Result, SweepError};

#[derive(Debug, Clone, Copy, Default)]
pub struct EmlNormalizer;

impl Normalizer for EmlNormalizer {
    fn format(&self) -> EmailFormat {
        EmailFormat::Eml
    }

    fn parse_parts(&self, bytes: &[u8]) -> Result<ParsedParts> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(SweepError::parse("eml", "empty message"));
        }

        let text = decode_lossy(bytes);
        let (raw_headers, _) = split_header_block(&text);
        let headers = HeaderMap::parse_block(raw_headers);
        if headers.is_empty() {
            return Err(SweepError::parse("eml", "no header fields before body"));
        }

        let message = MessageParser::default()
            .parse(bytes)
            .ok_or_else(|| SweepError::parse("eml", "MIME structure could not be decoded"))?;

        let subject = message.subject().map(str::to_string);
        let sender = message
            .from()
            .and_then(|from| from.first())
            .and_then(|addr| addr.address())
            .map(str::to_string);

        // first text/plain part only
        let mut text_body = message
            .text_body
            .iter()
            .filter_map(|id| message.parts.get(*id as usize))
            .find_map(|part| match &part.body {
                PartType::Text(t) => Some(t.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        let html_body = message
            .html_body
            .iter()
            .filter_map(|id| message.parts.get(*id as usize))
            .find_map(|part| match &part.body {
                PartType::Html(h) => Some(h.to_string()),
                _ => None,
            });

        // html-only mail: keep a text rendering for keyword scans
        if text_body.is_empty() && html_body.is_some() {
            if let Some(rendered) = message.body_text(0) {
                text_body = rendered.into_owned();
            }
        }

        let attachments = message
            .attachments()
            .map(|part| {
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string())
                    .to_ascii_lowercase();
                AttachmentInfo {
                    filename: part.attachment_name().unwrap_or("").to_string(),
                    content_type,
                    size: part.contents().len() as u64,
                }
            })
            .collect();

        Ok(ParsedParts {
            headers,
            subject,
            sender,
            text_body,
            html_body,
            attachments,
        })
    }
}

/// UTF-8 when valid, otherwise Windows-1252 (a superset of Latin-1).
fn decode_lossy(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &str = "From: \"Deals\" <promo@mail.deals.example.com>\r\n\
To: victim@example.net\r\n\
Subject: =?UTF-8?B?V2Vla2x5IGRlYWxz?=\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
Message-ID: <abc123@mail.deals.example.com>\r\n\
List-Unsubscribe: <mailto:unsub@deals.example.com>,\r\n\
\x20<https://deals.example.com/unsub?u=1>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: multipart/alternative; boundary=\"ALT\"\r\n\
\r\n\
--ALT\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Great deals inside.\r\n\
--ALT\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Great deals <a href=\"https://deals.example.com/optout\">unsubscribe</a></p>\r\n\
--ALT--\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"invoice.pdf\"\r\n\
Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
SGVsbG8gV29ybGQ=\r\n\
--XYZ--\r\n";

    #[test]
    fn test_parse_multipart_message() {
        let record = EmlNormalizer.parse(MULTIPART.as_bytes()).unwrap();
        assert_eq!(record.format, EmailFormat::Eml);
        assert_eq!(record.sender, "promo@mail.deals.example.com");
        assert_eq!(record.sender_domain.as_deref(), Some("mail.deals.example.com"));
        assert_eq!(record.subject, "Weekly deals");
        assert_eq!(
            record.message_id.as_deref(),
            Some("<abc123@mail.deals.example.com>")
        );
        assert_eq!(
            record.headers.get("list-unsubscribe"),
            Some("<mailto:unsub@deals.example.com>, <https://deals.example.com/unsub?u=1>")
        );
        assert!(record.text_body.contains("Great deals inside."));
        assert!(record.html_body.as_deref().unwrap().contains("optout"));
        assert_eq!(record.attachments.len(), 1);
        assert_eq!(record.attachments[0].filename, "invoice.pdf");
        assert_eq!(record.attachments[0].content_type, "application/pdf");
        assert_eq!(record.attachments[0].size, 11);
    }

    #[test]
    fn test_first_plain_part_wins() {
        let raw = "From: a@b.example\r\n\
Subject: two parts\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
FIRST PART\r\n\
--B\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Disposition: inline\r\n\
\r\n\
SECOND PART\r\n\
--B--\r\n";
        let record = EmlNormalizer.parse(raw.as_bytes()).unwrap();
        assert_eq!(record.text_body.trim_end(), "FIRST PART");
        assert!(!record.text_body.contains("SECOND PART"));
    }

    #[test]
    fn test_folded_header_is_unfolded() {
        let raw = "From: a@b.example\r\n\
List-Unsubscribe: <mailto:u@b.example>,\r\n\
\t<https://b.example/u>\r\n\
Subject: folded\r\n\
\r\n\
body\r\n";
        let record = EmlNormalizer.parse(raw.as_bytes()).unwrap();
        assert_eq!(
            record.headers.get("List-Unsubscribe"),
            Some("<mailto:u@b.example>, <https://b.example/u>")
        );
        assert_eq!(record.subject, "folded");
    }

    #[test]
    fn test_same_bytes_same_fingerprint() {
        let a = EmlNormalizer.parse(MULTIPART.as_bytes()).unwrap();
        let b = EmlNormalizer.parse(MULTIPART.as_bytes()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_plain_text_without_from_or_subject() {
        let raw = b"Date: Mon, 6 Jan 2025 10:00:00 +0000\n\nhello there\n";
        let record = EmlNormalizer.parse(raw).unwrap();
        assert_eq!(record.sender, "");
        assert_eq!(record.subject, "");
        assert!(record.html_body.is_none());
        assert!(record.text_body.contains("hello there"));
    }

    #[test]
    fn test_latin1_bytes_are_decoded() {
        let mut raw = b"From: a@b.example\nSubject: caf".to_vec();
        raw.push(0xE9);
        raw.extend_from_slice(b"\n\nbody\n");
        let record = EmlNormalizer.parse(&raw).unwrap();
        assert_eq!(record.sender, "a@b.example");
    }

    #[test]
    fn test_rejects_empty_and_headerless_input() {
        assert!(matches!(
            EmlNormalizer.parse(b"  \n"),
            Err(SweepError::Parse { .. })
        ));
        assert!(matches!(
            EmlNormalizer.parse(b"just some words without headers"),
            Err(SweepError::Parse { .. })
        ));
    }
}
