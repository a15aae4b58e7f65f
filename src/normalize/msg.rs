//! Outlook `.msg` files: an OLE compound file whose message properties are
//! stored as `__substg1.0_<tag><type>` streams.

use std::io::{Cursor, Read};

use cfb::CompoundFile;
use encoding_rs::{UTF_16LE, WINDOWS_1252};

use super::{AttachmentInfo, EmailFormat, HeaderMap, Normalizer, ParsedParts};
use crate::errors::{Result, SweepError};

const PROP_PREFIX: &str = "__substg1.0_";
const ATTACH_PREFIX: &str = "__attach_version1.0_";

const TAG_SUBJECT: &str = "0037";
const TAG_TRANSPORT_HEADERS: &str = "007D";
const TAG_SENDER_EMAIL: &str = "0C1F";
const TAG_SENDER_NAME: &str = "0C1A";
const TAG_BODY: &str = "1000";
const TAG_HTML: &str = "1013";
const TAG_MESSAGE_ID: &str = "1035";
const TAG_SENDER_SMTP: &str = "5D01";

const TAG_ATTACH_DATA: &str = "3701";
const TAG_ATTACH_FILENAME: &str = "3704";
const TAG_ATTACH_LONG_FILENAME: &str = "3707";
const TAG_ATTACH_MIME: &str = "370E";

const TYPE_UNICODE: &str = "001F";
const TYPE_STRING8: &str = "001E";
const TYPE_BINARY: &str = "0102";

type Container = CompoundFile<Cursor<Vec<u8>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgNormalizer;

impl Normalizer for MsgNormalizer {
    fn format(&self) -> EmailFormat {
        EmailFormat::Msg
    }

    fn parse_parts(&self, bytes: &[u8]) -> Result<ParsedParts> {
        let mut file = CompoundFile::open(Cursor::new(bytes.to_vec()))
            .map_err(|e| SweepError::parse("msg", format!("not an OLE compound file: {e}")))?;

        let has_properties = file
            .read_root_storage()
            .any(|entry| entry.is_stream() && entry.name().starts_with(PROP_PREFIX));
        if !has_properties {
            return Err(SweepError::parse("msg", "no message property streams"));
        }

        let raw_headers = read_string(&mut file, "", TAG_TRANSPORT_HEADERS)?;
        let subject = read_string(&mut file, "", TAG_SUBJECT)?;
        let message_id = read_string(&mut file, "", TAG_MESSAGE_ID)?;
        let sender = [TAG_SENDER_SMTP, TAG_SENDER_EMAIL]
            .iter()
            .map(|tag| read_string(&mut file, "", tag))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .find(|s| s.contains('@'));
        let sender_name = read_string(&mut file, "", TAG_SENDER_NAME)?;

        let mut headers = raw_headers
            .as_deref()
            .map(HeaderMap::parse_block)
            .unwrap_or_default();
        if headers.is_empty() {
            // Outlook drafts and some exports carry no transport headers
            if let Some(addr) = &sender {
                let from = match sender_name.as_deref().filter(|n| !n.is_empty()) {
                    Some(name) => format!("\"{name}\" <{addr}>"),
                    None => addr.clone(),
                };
                headers.push("From", from);
            }
            if let Some(s) = &subject {
                headers.push("Subject", s.clone());
            }
            if let Some(id) = &message_id {
                headers.push("Message-ID", id.clone());
            }
        }

        let text_body = read_string(&mut file, "", TAG_BODY)?.unwrap_or_default();
        let html_body = match read_string(&mut file, "", TAG_HTML)? {
            Some(html) => Some(html),
            None => read_stream(&mut file, &stream_path("", TAG_HTML, TYPE_BINARY))?
                .map(|b| decode_8bit(&b)),
        };

        let attachments = read_attachments(&mut file)?;

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

fn stream_path(storage: &str, tag: &str, ty: &str) -> String {
    format!("{storage}/{PROP_PREFIX}{tag}{ty}")
}

fn read_stream(file: &mut Container, path: &str) -> Result<Option<Vec<u8>>> {
    if !file.is_stream(path) {
        return Ok(None);
    }
    let mut stream = file
        .open_stream(path)
        .map_err(|e| SweepError::parse("msg", format!("cannot open {path}: {e}")))?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|e| SweepError::parse("msg", format!("truncated stream {path}: {e}")))?;
    Ok(Some(buf))
}

/// Unicode form first, then the 8-bit form.
fn read_string(file: &mut Container, storage: &str, tag: &str) -> Result<Option<String>> {
    if let Some(bytes) = read_stream(file, &stream_path(storage, tag, TYPE_UNICODE))? {
        let (decoded, _) = UTF_16LE.decode_without_bom_handling(&bytes);
        return Ok(Some(decoded.trim_end_matches('\0').to_string()));
    }
    Ok(read_stream(file, &stream_path(storage, tag, TYPE_STRING8))?
        .map(|bytes| decode_8bit(&bytes)))
}

fn decode_8bit(bytes: &[u8]) -> String {
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => WINDOWS_1252.decode(bytes).0.into_owned(),
    };
    text.trim_end_matches('\0').to_string()
}

fn read_attachments(file: &mut Container) -> Result<Vec<AttachmentInfo>> {
    let mut storages: Vec<String> = file
        .read_root_storage()
        .filter(|e| e.is_storage() && e.name().starts_with(ATTACH_PREFIX))
        .map(|e| format!("/{}", e.name()))
        .collect();
    storages.sort();

    let mut attachments = Vec::with_capacity(storages.len());
    for storage in storages {
        let filename = match read_string(file, &storage, TAG_ATTACH_LONG_FILENAME)? {
            Some(name) if !name.is_empty() => name,
            _ => read_string(file, &storage, TAG_ATTACH_FILENAME)?.unwrap_or_default(),
        };
        let content_type = read_string(file, &storage, TAG_ATTACH_MIME)?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string())
            .to_ascii_lowercase();
        let data_path = stream_path(&storage, TAG_ATTACH_DATA, TYPE_BINARY);
        let size = if file.is_stream(&data_path) {
            file.entry(&data_path).map(|e| e.len()).unwrap_or(0)
        } else {
            0
        };
        attachments.push(AttachmentInfo {
            filename,
            content_type,
            size,
        });
    }
    Ok(attachments)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    /// Build a minimal `.msg` container for tests.
    pub(crate) fn build_msg(headers: Option<&str>, subject: &str, body: &str) -> Vec<u8> {
        let mut file = CompoundFile::create(Cursor::new(Vec::new())).unwrap();
        let mut put = |path: String, data: Vec<u8>| {
            let mut s = file.create_stream(&path).unwrap();
            s.write_all(&data).unwrap();
        };
        if let Some(h) = headers {
            put(stream_path("", TAG_TRANSPORT_HEADERS, TYPE_UNICODE), utf16(h));
        }
        put(stream_path("", TAG_SUBJECT, TYPE_UNICODE), utf16(subject));
        put(stream_path("", TAG_BODY, TYPE_UNICODE), utf16(body));
        put(
            stream_path("", TAG_SENDER_EMAIL, TYPE_STRING8),
            b"billing@paypa1-alerts.example.com".to_vec(),
        );
        file.create_storage("/__attach_version1.0_#00000000").unwrap();
        {
            let storage = "/__attach_version1.0_#00000000";
            let mut s = file
                .create_stream(stream_path(storage, TAG_ATTACH_LONG_FILENAME, TYPE_UNICODE))
                .unwrap();
            s.write_all(&utf16("statement.html")).unwrap();
            drop(s);
            let mut s = file
                .create_stream(stream_path(storage, TAG_ATTACH_MIME, TYPE_STRING8))
                .unwrap();
            s.write_all(b"text/html").unwrap();
            drop(s);
            let mut s = file
                .create_stream(stream_path(storage, TAG_ATTACH_DATA, TYPE_BINARY))
                .unwrap();
            s.write_all(&[0u8; 64]).unwrap();
        }
        file.flush().unwrap();
        file.into_inner().into_inner()
    }

    #[test]
    fn test_parse_with_transport_headers() {
        let headers = "From: PayPal <billing@paypa1-alerts.example.com>\r\n\
Subject: Your account is limited\r\n\
Message-ID: <m1@paypa1-alerts.example.com>\r\n\
List-Unsubscribe: <https://paypa1-alerts.example.com/u>\r\n\r\n";
        let bytes = build_msg(Some(headers), "Your account is limited", "Verify your PayPal account");
        let record = MsgNormalizer.parse(&bytes).unwrap();
        assert_eq!(record.format, EmailFormat::Msg);
        assert_eq!(record.sender, "billing@paypa1-alerts.example.com");
        assert_eq!(record.subject, "Your account is limited");
        assert_eq!(
            record.headers.get("List-Unsubscribe"),
            Some("<https://paypa1-alerts.example.com/u>")
        );
        assert_eq!(record.text_body, "Verify your PayPal account");
        assert_eq!(record.attachments.len(), 1);
        assert_eq!(record.attachments[0].filename, "statement.html");
        assert_eq!(record.attachments[0].content_type, "text/html");
        assert_eq!(record.attachments[0].size, 64);
    }

    #[test]
    fn test_headers_synthesized_without_transport_block() {
        let bytes = build_msg(None, "Hello", "body");
        let record = MsgNormalizer.parse(&bytes).unwrap();
        assert_eq!(
            record.headers.get("From"),
            Some("billing@paypa1-alerts.example.com")
        );
        assert_eq!(record.headers.get("Subject"), Some("Hello"));
        assert_eq!(record.sender_domain.as_deref(), Some("paypa1-alerts.example.com"));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = MsgNormalizer.parse(b"definitely not OLE").unwrap_err();
        assert!(matches!(err, SweepError::Parse { .. }));
    }

    #[test]
    fn test_container_without_properties_is_parse_error() {
        let mut file = CompoundFile::create(Cursor::new(Vec::new())).unwrap();
        file.create_stream("/unrelated").unwrap().write_all(b"x").unwrap();
        file.flush().unwrap();
        let bytes = file.into_inner().into_inner();
        assert!(matches!(
            MsgNormalizer.parse(&bytes),
            Err(SweepError::Parse { .. })
        ));
    }
}
