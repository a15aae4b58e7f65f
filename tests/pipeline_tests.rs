//! Pipeline scenarios driven through the library.
//!
//! WHOIS is replaced by an in-memory client and unsubscribe endpoints are
//! served by `wiremock`, so nothing here leaves the machine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spamsweep::app::{RunContext, run_batch};
use spamsweep::config::Config;
use spamsweep::ledger::{ActionStatus, ActionType, load_entries};
use spamsweep::pipeline::{EmailState, Pipeline};
use spamsweep::reports::{PreparedReport, ReportDispatcher, ReportStore, dispatch_pending_reports};
use spamsweep::structured_output::{MetadataRecord, RunOutput};
use spamsweep::unsubscribe::{AttemptOutcome, MechanismKind, ReqwestTransport};
use spamsweep::whois::{IANA_WHOIS_SERVER, WhoisClient};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REGISTRY: &str = "whois.registry.test";

#[derive(Default)]
struct FakeWhois {
    calls: Mutex<Vec<(String, String)>>,
    hang: bool,
}

impl FakeWhois {
    fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    fn calls_for(&self, query: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, q)| q == query)
            .count()
    }
}

#[async_trait]
impl WhoisClient for FakeWhois {
    async fn query(&self, server: &str, query: &str) -> spamsweep::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((server.to_string(), query.to_string()));
        if self.hang {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if server == IANA_WHOIS_SERVER {
            return Ok(format!("domain: {}\nrefer: {REGISTRY}\n", query.to_uppercase()));
        }
        Ok(format!(
            "Domain Name: {}\nRegistrar: Test Registrar LLC\nCreation Date: 2024-12-30T00:00:00Z\nRegistrar Abuse Contact Email: abuse@registrar-abuse.com\n",
            query.to_uppercase()
        ))
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.directories.consume = root.join("consume");
    config.directories.processed = root.join("processed");
    config.directories.logs = root.join("logs");
    config.processing.request_timeout_secs = 1;
    config.processing.whois_timeout_secs = 1;
    config.processing.retry_initial_delay_ms = 0;
    config.processing.retry_max_delay_ms = 0;
    std::fs::create_dir_all(&config.directories.consume).unwrap();
    config
}

fn eml(from: &str, id: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "From: {from}\r\n\
         To: me@example.net\r\n\
         Subject: Offer {id}\r\n\
         Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
         Message-ID: <{id}@mailer.test>\r\n\
         {extra_headers}\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
}

fn drop_file(config: &Config, name: &str, content: impl AsRef<[u8]>) {
    std::fs::write(config.directories.consume.join(name), content).unwrap();
}

async fn run(config: &Config, whois: Arc<FakeWhois>, run_id: &str) -> RunOutput {
    let ctx = RunContext::open_with_id(config, run_id.to_string()).unwrap();
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout()).unwrap());
    let pipeline = Pipeline::from_parts(config, Arc::clone(&ctx.ledger), transport, whois).unwrap();
    run_batch(config, &ctx, &pipeline, std::future::pending())
        .await
        .unwrap()
}

fn only(output: &RunOutput) -> &MetadataRecord {
    assert_eq!(output.emails.len(), 1, "expected exactly one email");
    &output.emails[0]
}

#[tokio::test]
async fn test_header_http_succeeds_and_mailto_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let header = format!(
        "List-Unsubscribe: <{}/u>, <mailto:u@spammy-deals.com>\r\n",
        server.uri()
    );
    drop_file(
        &config,
        "a.eml",
        eml("deals@spammy-deals.com", "a1", &header, "Great prices."),
    );

    let output = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let email = only(&output);

    assert_eq!(email.state, EmailState::Completed);
    let kinds: Vec<MechanismKind> = email.unsubscribe.iter().map(|m| m.mechanism.kind).collect();
    assert_eq!(kinds, vec![MechanismKind::HeaderHttp, MechanismKind::HeaderMailto]);
    assert_eq!(email.unsubscribe[0].outcome, AttemptOutcome::Success);
    assert_eq!(email.unsubscribe[0].attempts.len(), 1);
    assert_eq!(email.unsubscribe[0].attempts[0].http_status, Some(200));
    assert_eq!(email.unsubscribe[1].outcome, AttemptOutcome::Skipped);
    assert!(email.unsubscribe[1].attempts.is_empty());

    let entries = load_entries(&config.ledger_path()).unwrap();
    let statuses: Vec<ActionStatus> = entries
        .iter()
        .filter(|e| e.action == ActionType::UnsubscribeAttempt)
        .map(|e| e.status)
        .collect();
    assert_eq!(statuses, vec![ActionStatus::Success, ActionStatus::Skipped]);
}

#[tokio::test]
async fn test_header_mechanisms_attempted_before_body_links() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let header = format!("List-Unsubscribe: <{}/header>\r\n", server.uri());
    let body = format!("Hello!\r\nTo unsubscribe visit {}/body now.", server.uri());
    drop_file(&config, "a.eml", eml("deals@spammy-deals.com", "a2", &header, &body));

    let output = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let email = only(&output);

    let kinds: Vec<MechanismKind> = email.unsubscribe.iter().map(|m| m.mechanism.kind).collect();
    assert_eq!(kinds, vec![MechanismKind::HeaderHttp, MechanismKind::BodyLink]);

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/header", "/body"]);
}

#[tokio::test]
async fn test_endpoint_that_always_times_out_is_tried_max_attempts_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let header = format!("List-Unsubscribe: <{}/slow>\r\n", server.uri());
    drop_file(&config, "a.eml", eml("deals@spammy-deals.com", "a3", &header, "Hi"));

    let output = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let email = only(&output);

    assert_eq!(email.state, EmailState::Completed);
    let result = &email.unsubscribe[0];
    assert_eq!(result.outcome, AttemptOutcome::Failure);
    assert_eq!(result.attempts.len(), 3);
    assert!(result.attempts.iter().all(|a| a.outcome == AttemptOutcome::Timeout));
    assert_eq!(
        result.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert_eq!(output.totals.unsubscribe_failures, 1);
}

#[tokio::test]
async fn test_paypal_mention_without_headers() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    drop_file(
        &config,
        "a.eml",
        eml(
            "service@account-verify.com",
            "a4",
            "",
            "Your PayPal account has been limited. Confirm your details today.",
        ),
    );

    let output = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let email = only(&output);

    assert!(email.unsubscribe.is_empty());
    assert_eq!(email.company_matches.len(), 1);
    assert_eq!(email.company_matches[0].company, "paypal");
    assert_eq!(email.company_matches[0].abuse_contact, "spoof@paypal.com");
    assert!(email.reports.iter().any(|r| r.recipient == "spoof@paypal.com"));
}

#[tokio::test]
async fn test_whois_timeout_still_completes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    drop_file(
        &config,
        "a.eml",
        eml("service@account-verify.com", "a5", "", "Log in to PayPal now."),
    );

    let output = run(&config, Arc::new(FakeWhois::hanging()), "run-1").await;
    let email = only(&output);

    assert_eq!(email.state, EmailState::Completed);
    let domain = email.domain.as_ref().expect("domain record");
    assert_eq!(domain.domain, "account-verify.com");
    assert!(domain.registrar.is_none());
    assert!(domain.abuse_contact.is_none());
    assert!(domain.error.is_some());
    assert_eq!(email.company_matches.len(), 1);
    assert!(!email.reports.is_empty());

    let entries = load_entries(&config.ledger_path()).unwrap();
    assert!(entries.iter().any(|e| e.action == ActionType::WhoisLookup
        && e.status == ActionStatus::Unresolved));
}

#[tokio::test]
async fn test_domain_resolved_once_per_run() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.processing.max_concurrent_emails = 2;
    drop_file(&config, "a.eml", eml("a@spammy-deals.com", "b1", "", "one"));
    drop_file(&config, "b.eml", eml("b@news.spammy-deals.com", "b2", "", "two"));
    drop_file(&config, "c.eml", eml("c@spammy-deals.com", "b3", "", "three"));

    let whois = Arc::new(FakeWhois::default());
    let output = run(&config, Arc::clone(&whois), "run-1").await;

    assert_eq!(output.totals.completed, 3);
    assert_eq!(whois.calls_for("spammy-deals.com"), 1);
    assert_eq!(whois.calls_for("com"), 1);
    for email in &output.emails {
        let domain = email.domain.as_ref().unwrap();
        assert_eq!(domain.registrar.as_deref(), Some("Test Registrar LLC"));
        assert_eq!(domain.abuse_contact.as_deref(), Some("abuse@registrar-abuse.com"));
    }
}

#[tokio::test]
async fn test_second_run_repeats_no_actions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.processing.move_processed = false;
    let header = format!("List-Unsubscribe: <{}/u>\r\n", server.uri());
    drop_file(
        &config,
        "a.eml",
        eml("deals@spammy-deals.com", "c1", &header, "PayPal says hi"),
    );

    let first = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let second = run(&config, Arc::new(FakeWhois::default()), "run-2").await;

    assert!(!only(&first).reports.is_empty());
    let again = only(&second);
    assert_eq!(again.state, EmailState::Completed);
    assert_eq!(again.unsubscribe[0].outcome, AttemptOutcome::Skipped);
    assert!(again.reports.is_empty());

    let entries = load_entries(&config.ledger_path()).unwrap();
    let mut seen: HashMap<(String, ActionType, String), usize> = HashMap::new();
    for e in &entries {
        *seen
            .entry((e.fingerprint.clone(), e.action, e.target.clone()))
            .or_default() += 1;
    }
    for ((_, action, target), count) in &seen {
        if matches!(action, ActionType::UnsubscribeAttempt | ActionType::ReportPrepared) {
            assert_eq!(*count, 1, "{action} for {target} recorded {count} times");
        }
    }
    assert!(entries.iter().all(|e| e.run_id == "run-1"));

    let run2 = dir.path().join("logs").join("actions_taken_run-2.jsonl");
    assert!(load_entries(&run2).unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_msg_fails_alone() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    drop_file(&config, "bad.msg", b"this is not a compound file at all".to_vec());
    drop_file(&config, "good.eml", eml("a@spammy-deals.com", "d1", "", "hello"));

    let output = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    assert_eq!(output.totals.files_found, 2);
    assert_eq!(output.totals.failed, 1);
    assert_eq!(output.totals.completed, 1);
    assert_eq!(output.totals.moved, 1);

    let failed = output
        .emails
        .iter()
        .find(|e| e.state == EmailState::Failed)
        .unwrap();
    assert_eq!(failed.error_category.as_deref(), Some("parse"));

    let entries = load_entries(&config.ledger_path()).unwrap();
    let for_failed: Vec<_> = entries
        .iter()
        .filter(|e| e.fingerprint == failed.fingerprint)
        .collect();
    assert_eq!(for_failed.len(), 1);
    assert_eq!(for_failed[0].action, ActionType::NormalizeFailed);
    assert_eq!(for_failed[0].target, "bad.msg");

    assert!(config.directories.consume.join("bad.msg").exists());
    assert!(!config.directories.consume.join("good.eml").exists());
    assert!(config.directories.processed.join("good.eml").exists());

    let metadata = std::fs::read_to_string(&output.files.email_metadata).unwrap();
    assert_eq!(metadata.lines().count(), 2);
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl ReportDispatcher for RecordingDispatcher {
    async fn dispatch(&self, report: &PreparedReport) -> spamsweep::Result<()> {
        self.sent.lock().unwrap().push(report.recipient.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_prepared_reports_dispatch_once() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    drop_file(&config, "a.eml", eml("x@account-verify.com", "e1", "", "Your PayPal invoice"));

    let ctx = RunContext::open_with_id(&config, "run-1".to_string()).unwrap();
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout()).unwrap());
    let whois = Arc::new(FakeWhois::default());
    let pipeline = Pipeline::from_parts(&config, Arc::clone(&ctx.ledger), transport, whois).unwrap();
    let output = run_batch(&config, &ctx, &pipeline, std::future::pending())
        .await
        .unwrap();
    let prepared = only(&output).reports.len();
    assert!(prepared >= 4, "authorities, registrar and PayPal expected");

    let store = ReportStore::new(config.reports_dir());
    let dispatcher = RecordingDispatcher::default();
    let summary = dispatch_pending_reports(&ctx.ledger, &store, &dispatcher)
        .await
        .unwrap();
    assert_eq!(summary.sent, prepared);
    assert_eq!(summary.failed, 0);
    assert!(
        dispatcher
            .sent
            .lock()
            .unwrap()
            .contains(&"spoof@paypal.com".to_string())
    );

    let again = dispatch_pending_reports(&ctx.ledger, &store, &dispatcher)
        .await
        .unwrap();
    assert_eq!(again.sent, 0);
}

#[tokio::test]
async fn test_interrupt_stops_before_processing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    drop_file(&config, "a.eml", eml("a@spammy-deals.com", "f1", "", "hello"));

    let ctx = RunContext::open_with_id(&config, "run-1".to_string()).unwrap();
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout()).unwrap());
    let pipeline = Pipeline::from_parts(
        &config,
        Arc::clone(&ctx.ledger),
        transport,
        Arc::new(FakeWhois::default()),
    )
    .unwrap();
    let output = run_batch(&config, &ctx, &pipeline, std::future::ready(()))
        .await
        .unwrap();

    assert!(output.totals.interrupted);
    assert!(output.emails.is_empty());
    assert!(config.directories.consume.join("a.eml").exists());
}

#[tokio::test]
async fn test_disabled_unsubscribe_does_not_block_later_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.processing.move_processed = false;
    config.features.auto_unsubscribe = false;
    let header = format!("List-Unsubscribe: <{}/u>\r\n", server.uri());
    drop_file(&config, "a.eml", eml("deals@spammy-deals.com", "g1", &header, "Hi"));

    let first = run(&config, Arc::new(FakeWhois::default()), "run-1").await;
    let result = &only(&first).unsubscribe[0];
    assert_eq!(result.outcome, AttemptOutcome::Skipped);
    assert_eq!(result.note.as_deref(), Some("auto-unsubscribe disabled"));
    assert!(server.received_requests().await.unwrap().is_empty());
    let entries = load_entries(&config.ledger_path()).unwrap();
    assert!(!entries.iter().any(|e| e.action == ActionType::UnsubscribeAttempt));

    config.features.auto_unsubscribe = true;
    let second = run(&config, Arc::new(FakeWhois::default()), "run-2").await;
    let result = &only(&second).unsubscribe[0];
    assert_eq!(result.outcome, AttemptOutcome::Success);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
