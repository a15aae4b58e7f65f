//! Performance benchmarks for the per-email CPU work.
//!
//! Normalization, unsubscribe extraction and company matching run once per
//! file before any network I/O, so they bound batch throughput on large
//! consume directories.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use spamsweep::companies::CompanyMatcher;
use spamsweep::emails::EmailSet;
use spamsweep::normalize::{EmailFormat, HeaderMap, normalize};
use spamsweep::unsubscribe::extract::{extract_mechanisms, html_links, text_links};
use spamsweep::whois::WhoisFields;

/// Typical newsletter-style spam: both header and body mechanisms.
const SAMPLE_EML: &str = "Return-Path: <bounce@mailer.spammy-deals.com>\r\n\
Received: from mta7.spammy-deals.com (mta7.spammy-deals.com [203.0.113.7])\r\n\
    by mx.local (Postfix) with ESMTPS id 12345\r\n\
    for <me@example.net>; Mon, 6 Jan 2025 10:00:00 +0000\r\n\
From: \"Deals\" <deals@spammy-deals.com>\r\n\
To: me@example.net\r\n\
Subject: Last chance: 90% off\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
Message-ID: <bench-1@spammy-deals.com>\r\n\
List-Unsubscribe: <https://spammy-deals.com/u?id=1>, <mailto:unsub@spammy-deals.com>\r\n\
List-Unsubscribe-Post: List-Unsubscribe=One-Click\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Your PayPal rewards are waiting.\r\n\
To unsubscribe visit https://spammy-deals.com/optout?id=1\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Your <b>PayPal</b> rewards are waiting.</p>\r\n\
<p><a href=\"https://spammy-deals.com/shop\">Shop</a></p>\r\n\
<p>Don't want these? <a href=\"https://spammy-deals.com/prefs\">Manage preferences</a></p>\r\n\
</body></html>\r\n\
--b1--\r\n";

const WHOIS_RESPONSE: &str = "Domain Name: SPAMMY-DEALS.COM\n\
Registrar WHOIS Server: whois.namecheap.com\n\
Creation Date: 2024-11-02T10:00:00Z\n\
Registry Expiry Date: 2025-11-02T10:00:00Z\n\
Registrar: NameCheap, Inc.\n\
Registrar Abuse Contact Email: abuse@namecheap.com\n\
Name Server: DNS1.REGISTRAR-SERVERS.COM\n\
Name Server: DNS2.REGISTRAR-SERVERS.COM\n\
Tech Email: tech@withheldforprivacy.com\n";

/// Many `Received` hops plus a long body of filler links.
fn generate_large_eml(hops: usize, links: usize) -> String {
    let mut eml = String::with_capacity(SAMPLE_EML.len() + hops * 160 + links * 80);
    for i in 0..hops {
        eml.push_str(&format!(
            "Received: from relay{i}.example.com (relay{i}.example.com [198.51.100.{}])\r\n    by relay.example.com; Mon, 6 Jan 2025 10:00:00 +0000\r\n",
            (i % 254) + 1
        ));
    }
    eml.push_str("From: deals@spammy-deals.com\r\nSubject: Large\r\nContent-Type: text/plain\r\n\r\n");
    for i in 0..links {
        eml.push_str(&format!("See item https://shop.example.com/item/{i} today\r\n"));
    }
    eml.push_str("To unsubscribe visit https://spammy-deals.com/u\r\n");
    eml
}

fn bench_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    group.throughput(Throughput::Bytes(SAMPLE_EML.len() as u64));
    group.bench_function("sample_eml", |b| {
        b.iter(|| normalize(EmailFormat::Eml, black_box(SAMPLE_EML.as_bytes())))
    });

    for hops in [50usize, 200] {
        let large = generate_large_eml(hops, 100);
        group.throughput(Throughput::Bytes(large.len() as u64));
        group.bench_with_input(BenchmarkId::new("received_hops", hops), &large, |b, eml| {
            b.iter(|| normalize(EmailFormat::Eml, black_box(eml.as_bytes())))
        });
    }

    let block = SAMPLE_EML.split("\r\n\r\n").next().unwrap_or_default();
    group.bench_function("header_block_unfolding", |b| {
        b.iter(|| HeaderMap::parse_block(black_box(block)))
    });

    group.finish();
}

fn bench_unsubscribe_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("unsubscribe");
    let record = normalize(EmailFormat::Eml, SAMPLE_EML.as_bytes()).expect("sample parses");

    group.bench_function("extract_mechanisms", |b| {
        b.iter(|| extract_mechanisms(black_box(&record)))
    });

    if let Some(html) = record.html_body.as_deref() {
        group.bench_function("html_links", |b| b.iter(|| html_links(black_box(html))));
    }

    let large = generate_large_eml(0, 500);
    group.bench_function("text_links_500_urls", |b| {
        b.iter(|| text_links(black_box(&large)))
    });

    group.finish();
}

fn bench_company_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("companies");
    let matcher = CompanyMatcher::builtin();
    let record = normalize(EmailFormat::Eml, SAMPLE_EML.as_bytes()).expect("sample parses");

    group.bench_function("match_record", |b| {
        b.iter(|| matcher.match_record(black_box(&record)))
    });
    group.bench_function("construct_builtin", |b| b.iter(CompanyMatcher::builtin));

    group.finish();
}

fn bench_whois_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("whois");

    group.bench_function("parse_fields", |b| {
        b.iter(|| WhoisFields::parse(black_box(WHOIS_RESPONSE)))
    });
    group.bench_function("email_ranking", |b| {
        b.iter(|| {
            let mut set = EmailSet::new();
            set.absorb_text(black_box(WHOIS_RESPONSE));
            set.best_abuse_contact()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_normalization,
    bench_unsubscribe_extraction,
    bench_company_matching,
    bench_whois_parsing
);
criterion_main!(benches);
