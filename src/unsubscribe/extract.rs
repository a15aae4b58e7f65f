//! Mechanism extraction: `List-Unsubscribe` (RFC 2369), the one-click
//! marker (RFC 8058), and keyword-qualified links in the bodies.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{MechanismKind, UnsubscribeMechanism};
use crate::normalize::EmailRecord;

/// Anchor or surrounding text that signals unsubscribe intent.
const INTENT_KEYWORDS: &[&str] = &[
    "unsubscribe",
    "opt out",
    "opt-out",
    "optout",
    "remove me",
    "manage preferences",
    "update preferences",
    "manage subscription",
];

/// Looser phrasings where the intent words are split by a few others.
static INTENT_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bremove\b.{0,40}\blist\b|\bstop\b.{0,40}\be-?mails?\b|\bclick\s+here\b.{0,40}\bremove")
        .unwrap()
});

/// URL path fragments that signal unsubscribe intent on their own.
const PATH_KEYWORDS: &[&str] = &["unsubscribe", "optout", "opt-out", "remove"];

/// Characters of context considered on each side of a plain-text URL.
const CONTEXT_RADIUS: usize = 80;

/// Parent text longer than this is treated as page body, not context.
const MAX_PARENT_CONTEXT: usize = 300;

static ANGLE_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\s*([^<>]+?)\s*>").unwrap());
static TEXT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"'()\[\]{}]+"#).unwrap());
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

/// Every mechanism in `record`, header-derived first, duplicates removed.
pub fn extract_mechanisms(record: &EmailRecord) -> Vec<UnsubscribeMechanism> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for mechanism in header_mechanisms(record) {
        if seen.insert(dedupe_key(&mechanism.target)) {
            out.push(mechanism);
        }
    }

    let mut body = Vec::new();
    if let Some(html) = record.html_body.as_deref() {
        body.extend(html_links(html));
    }
    body.extend(text_links(&record.text_body));
    for mechanism in body {
        if seen.insert(dedupe_key(&mechanism.target)) {
            out.push(mechanism);
        }
    }
    out
}

/// Mechanisms from every `List-Unsubscribe` header, in header order.
pub fn header_mechanisms(record: &EmailRecord) -> Vec<UnsubscribeMechanism> {
    let one_click = record.headers.contains("List-Unsubscribe-Post");
    let mut out = Vec::new();
    for value in record.headers.get_all("List-Unsubscribe") {
        let mut uris: Vec<&str> = ANGLE_URI
            .captures_iter(value)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if uris.is_empty() {
            // some senders omit the angle brackets
            uris = value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        }
        for uri in uris {
            let lower = uri.to_ascii_lowercase();
            let kind = if lower.starts_with("mailto:") {
                MechanismKind::HeaderMailto
            } else if lower.starts_with("http://") || lower.starts_with("https://") {
                MechanismKind::HeaderHttp
            } else {
                continue;
            };
            out.push(UnsubscribeMechanism {
                kind,
                target: uri.to_string(),
                source: "List-Unsubscribe".to_string(),
                one_click: one_click && kind == MechanismKind::HeaderHttp,
            });
        }
    }
    out
}

/// Anchors whose text, nearby text or path carries unsubscribe intent.
pub fn html_links(html: &str) -> Vec<UnsubscribeMechanism> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for (index, anchor) in doc.select(&ANCHOR).enumerate() {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if !is_http(href) {
            continue;
        }
        let anchor_text = collapse_ws(&anchor.text().collect::<String>());
        let title = anchor.value().attr("title").unwrap_or("");
        let intent = has_intent(&anchor_text)
            || has_intent(title)
            || path_has_intent(href)
            || parent_text(anchor)
                .map(|t| has_intent(&t))
                .unwrap_or(false);
        if intent {
            out.push(UnsubscribeMechanism {
                kind: MechanismKind::BodyLink,
                target: href.to_string(),
                source: format!("html:a[{index}]"),
                one_click: false,
            });
        }
    }
    out
}

/// Plain-text URLs with intent in their surrounding text or their path.
pub fn text_links(text: &str) -> Vec<UnsubscribeMechanism> {
    let mut out = Vec::new();
    for m in TEXT_URL.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', '>']);
        let context = context_window(text, m.start(), m.end());
        if has_intent(&context) || path_has_intent(url) {
            out.push(UnsubscribeMechanism {
                kind: MechanismKind::BodyLink,
                target: url.to_string(),
                source: format!("text:{}", m.start()),
                one_click: false,
            });
        }
    }
    out
}

/// Canonical form used for deduplication: parsed, fragment dropped.
pub fn normalize_uri(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

fn dedupe_key(target: &str) -> String {
    normalize_uri(target).unwrap_or_else(|| target.trim().to_ascii_lowercase())
}

fn is_http(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn has_intent(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lower = collapse_ws(&text.to_lowercase());
    INTENT_KEYWORDS.iter().any(|k| lower.contains(k)) || INTENT_PATTERNS.is_match(&lower)
}

fn path_has_intent(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    let path = url.path().to_ascii_lowercase();
    PATH_KEYWORDS.iter().any(|k| path.contains(k))
}

fn parent_text(anchor: ElementRef<'_>) -> Option<String> {
    let parent = anchor.parent().and_then(ElementRef::wrap)?;
    if matches!(parent.value().name(), "body" | "html") {
        return None;
    }
    let text = collapse_ws(&parent.text().collect::<String>());
    (text.len() <= MAX_PARENT_CONTEXT).then_some(text)
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Up to `CONTEXT_RADIUS` characters on each side of `start..end`, never
/// crossing a line break.
fn context_window(text: &str, start: usize, end: usize) -> String {
    let line_start = text[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = text[end..].find('\n').map(|i| end + i).unwrap_or(text.len());
    let before: String = {
        let chars: Vec<char> = text[line_start..start]
            .chars()
            .rev()
            .take(CONTEXT_RADIUS)
            .collect();
        chars.into_iter().rev().collect()
    };
    let after: String = text[end..line_end].chars().take(CONTEXT_RADIUS).collect();
    format!("{before} {after}")
}
