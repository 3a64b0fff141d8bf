//! Decision pipeline with the real reputation and scanner clients pointed at
//! fake HTTP services.

use axum::extract::{Multipart, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use mail_gateway::authentication::StaticResolver;
use mail_gateway::config::{Config, ReputationConfig, ScannerConfig};
use mail_gateway::mime::MimeParser;
use mail_gateway::services::{AbuseIpDbClient, VirusTotalClient};
use mail_gateway::storage::InMemoryMailStore;
use mail_gateway::{build_mail_service, Mail, MailService};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Reputation scores: 203.0.113.66 is abusive, everything else is clean.
/// Scanner: every upload completes clean on the first poll.
async fn fake_services() -> String {
    async fn check(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        let ip = params.get("ipAddress").cloned().unwrap_or_default();
        let score = if ip == "203.0.113.66" { 90 } else { 0 };
        Json(json!({"data": {"ipAddress": ip, "abuseConfidenceScore": score}}))
    }

    async fn upload(mut multipart: Multipart) -> Json<Value> {
        while let Some(field) = multipart.next_field().await.unwrap() {
            let _ = field.bytes().await.unwrap();
        }
        Json(json!({"data": {"id": "a-1"}}))
    }

    async fn analysis() -> Json<Value> {
        Json(json!({"data": {"attributes": {"status": "completed",
            "stats": {"malicious": 0, "suspicious": 0}}}}))
    }

    let app = Router::new()
        .route("/check", get(check))
        .route("/files", post(upload))
        .route("/analyses/:id", get(analysis));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

const RAW: &str = "From: sender@test.com\r\n\
To: alice@example.com\r\n\
Subject: report\r\n\
DKIM-Signature: v=1; d=test.com; s=s1; b=AAAA\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--B\r\n\
Content-Type: text/csv; name=\"report.csv\"\r\n\
Content-Disposition: attachment; filename=\"report.csv\"\r\n\
\r\n\
a,b,c\r\n\
--B--\r\n";

async fn run(sender_ip: &str) -> Arc<MailService> {
    let base = fake_services().await;

    let mut config = Config::default();
    config.directory.recipients = vec!["alice@example.com".to_string()];
    config.validation.bypass_domain = Some("test.com".to_string());

    let reputation = AbuseIpDbClient::new(ReputationConfig {
        api_url: format!("{}/check", base),
        api_key: "k".to_string(),
        ..ReputationConfig::default()
    })
    .unwrap();
    let scanner = VirusTotalClient::new(ScannerConfig {
        api_url: base,
        api_key: "k".to_string(),
        poll_interval_ms: 10,
        ..ScannerConfig::default()
    })
    .unwrap();

    let resolver = StaticResolver::new()
        .with_txt("test.com", "v=spf1 ip4:203.0.113.0/24 -all")
        .with_txt("_dmarc.test.com", "v=DMARC1; p=quarantine");

    let service = build_mail_service(
        &config,
        Arc::new(resolver),
        Arc::new(reputation),
        Arc::new(scanner),
        Arc::new(InMemoryMailStore::new()),
    );

    let message = MimeParser::parse(RAW.as_bytes()).unwrap();
    assert_eq!(message.attachments.len(), 1);
    let mail = Mail::new(message, RAW.as_bytes().to_vec());
    service.add_mail("alice@example.com", mail, sender_ip).await;
    service
}

#[tokio::test]
async fn test_clean_sender_delivered() {
    let service = run("203.0.113.10").await;
    let mails = service.get_mail_by_recipient("alice@example.com").await.unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].message.attachments[0].filename, "report.csv");
    assert!(service.get_blocked_mails().await.is_empty());
}

#[tokio::test]
async fn test_abusive_sender_quarantined() {
    let service = run("203.0.113.66").await;
    assert!(service.get_all_mails().await.is_empty());

    let blocked = service.get_blocked_mails().await;
    let reason = blocked.keys().next().unwrap();
    assert_eq!(
        reason,
        "reputation check failed: IP 203.0.113.66 flagged as abusive (score: 90)"
    );
}

#[tokio::test]
async fn test_spf_failure_also_fails_dmarc() {
    let service = run("198.51.100.9").await;
    let blocked = service.get_blocked_mails().await;
    let reason = blocked.keys().next().unwrap();
    assert!(reason.starts_with("SPF check failed: fail"), "reason: {}", reason);
    assert!(reason.contains("DMARC failed: SPF=fail, DKIM=pass"), "reason: {}", reason);
}
