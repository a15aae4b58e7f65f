//! Impersonated-company detection.
//!
//! A static table of brands and their phishing/abuse desks, merged with
//! the operator's `additional_company_contacts`. On an id collision the
//! operator's address wins; unknown ids become new companies whose only
//! signature is their own name.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use schemars::JsonSchema;
use scraper::Html;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SweepError};
use crate::normalize::EmailRecord;

/// (id, display name, abuse contact, signature terms)
const BUILTIN_COMPANIES: &[(&str, &str, &str, &[&str])] = &[
    ("paypal", "PayPal", "spoof@paypal.com", &["paypal"]),
    ("amazon", "Amazon", "stop-spoofing@amazon.com", &["amazon"]),
    ("apple", "Apple", "reportphishing@apple.com", &["apple", "icloud", "itunes"]),
    (
        "microsoft",
        "Microsoft",
        "phish@office365.microsoft.com",
        &["microsoft", "office 365", "office365", "outlook.com"],
    ),
    ("google", "Google", "phishing@gmail.com", &["google", "gmail"]),
    ("facebook", "Facebook", "phish@fb.com", &["facebook", "instagram"]),
    ("ebay", "eBay", "spoof@ebay.com", &["ebay"]),
    ("netflix", "Netflix", "phishing@netflix.com", &["netflix"]),
    (
        "ups",
        "UPS",
        "fraud@ups.com",
        &["ups.com", "ups package", "ups delivery", "ups shipment", "united parcel service"],
    ),
    ("fedex", "FedEx", "abuse@fedex.com", &["fedex"]),
    ("wells fargo", "Wells Fargo", "reportfraud@wellsfargo.com", &["wells fargo", "wellsfargo"]),
    (
        "chase",
        "Chase",
        "abuse@chase.com",
        &["chase bank", "chase.com", "chase online", "jpmorgan"],
    ),
    (
        "bank of america",
        "Bank of America",
        "abuse@bankofamerica.com",
        &["bank of america", "bankofamerica"],
    ),
];

/// Where a company's abuse contact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContactOrigin {
    BuiltIn,
    User,
}

impl fmt::Display for ContactOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContactOrigin::BuiltIn => "built_in",
            ContactOrigin::User => "user",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompanyMatch {
    /// Lowercase company identifier
    pub company: String,
    pub display_name: String,
    /// Signature term that matched, as written in the table
    pub matched_term: String,
    pub abuse_contact: String,
    pub contact_origin: ContactOrigin,
}

#[derive(Debug, Clone)]
struct CompanySignature {
    id: String,
    display_name: String,
    abuse_contact: String,
    origin: ContactOrigin,
    terms: Vec<(String, Regex)>,
}

#[derive(Debug, Clone)]
pub struct CompanyMatcher {
    companies: Vec<CompanySignature>,
}

impl CompanyMatcher {
    /// Built-in table only.
    pub fn builtin() -> Self {
        let companies = BUILTIN_COMPANIES
            .iter()
            .map(|(id, name, contact, terms)| CompanySignature {
                id: id.to_string(),
                display_name: name.to_string(),
                abuse_contact: contact.to_string(),
                origin: ContactOrigin::BuiltIn,
                terms: terms.iter().map(|t| (t.to_string(), term_regex(t))).collect(),
            })
            .collect();
        Self { companies }
    }

    /// Built-in table overridden and extended by `additional`.
    pub fn new(additional: &BTreeMap<String, String>) -> Result<Self> {
        let mut matcher = Self::builtin();
        for (name, contact) in additional {
            let id = name.trim().to_lowercase();
            if id.is_empty() {
                return Err(SweepError::configuration(
                    "additional_company_contacts contains an empty company name",
                ));
            }
            let contact = contact.trim().to_string();
            match matcher.companies.iter_mut().find(|c| c.id == id) {
                Some(existing) => {
                    existing.abuse_contact = contact;
                    existing.origin = ContactOrigin::User;
                }
                None => matcher.companies.push(CompanySignature {
                    display_name: name.trim().to_string(),
                    abuse_contact: contact,
                    origin: ContactOrigin::User,
                    terms: vec![(id.clone(), term_regex(&id))],
                    id,
                }),
            }
        }
        Ok(matcher)
    }

    /// Contact table as (id, contact, origin), table order.
    pub fn contacts(&self) -> Vec<(&str, &str, ContactOrigin)> {
        self.companies
            .iter()
            .map(|c| (c.id.as_str(), c.abuse_contact.as_str(), c.origin))
            .collect()
    }

    /// Companies whose signature appears in `text`, one entry per company.
    pub fn match_text(&self, text: &str) -> Vec<CompanyMatch> {
        self.companies
            .iter()
            .filter_map(|company| {
                company
                    .terms
                    .iter()
                    .find(|(_, re)| re.is_match(text))
                    .map(|(term, _)| CompanyMatch {
                        company: company.id.clone(),
                        display_name: company.display_name.clone(),
                        matched_term: term.clone(),
                        abuse_contact: company.abuse_contact.clone(),
                        contact_origin: company.origin,
                    })
            })
            .collect()
    }

    /// Scan the subject, the text body and the visible HTML text.
    pub fn match_record(&self, record: &EmailRecord) -> Vec<CompanyMatch> {
        let mut text = String::with_capacity(record.subject.len() + record.text_body.len());
        text.push_str(&record.subject);
        text.push('\n');
        text.push_str(&record.text_body);
        if let Some(html) = record.html_body.as_deref() {
            text.push('\n');
            text.push_str(&html_text(html));
        }
        self.match_text(&text)
    }
}

impl Default for CompanyMatcher {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Case-insensitive, word-bounded, any whitespace between words.
fn term_regex(term: &str) -> Regex {
    let body = term
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    Regex::new(&format!(r"(?i)\b{body}\b")).expect("escaped signature term")
}

fn html_text(html: &str) -> String {
    Html::parse_document(html)
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
}
