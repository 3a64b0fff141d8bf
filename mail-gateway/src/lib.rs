//! mail-gateway: inbound SMTP gateway
//!
//! Accepts mail over SMTP, decodes it, and files one copy per recipient in
//! either the recipient's mailbox or quarantine.
//!
//! # Pipeline
//!
//! 1. [`smtp`]: session state machine; unknown recipients are refused at `RCPT TO`
//! 2. [`mime`]: headers, addresses, text bodies, attachments, embedded files
//! 3. [`authentication`] and [`services`]: SPF, DKIM, DMARC, sender IP
//!    reputation, content scanning
//! 4. [`validation`]: collects every failed check and decides
//! 5. [`storage`]: in-memory mailboxes and quarantine
//!
//! # Example
//!
//! ```no_run
//! use mail_gateway::authentication::TrustDnsResolver;
//! use mail_gateway::services::{AbuseIpDbClient, VirusTotalClient};
//! use mail_gateway::smtp::SmtpServer;
//! use mail_gateway::storage::InMemoryMailStore;
//! use mail_gateway::{build_mail_service, Config};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let service = build_mail_service(
//!         &config,
//!         Arc::new(TrustDnsResolver::new()),
//!         Arc::new(AbuseIpDbClient::new(config.reputation.clone())?),
//!         Arc::new(VirusTotalClient::new(config.scanner.clone())?),
//!         Arc::new(InMemoryMailStore::new()),
//!     );
//!
//!     SmtpServer::new(&config, service, None)
//!         .run(CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod authentication;
pub mod config;
pub mod directory;
pub mod error;
pub mod mime;
pub mod models;
pub mod security;
pub mod service;
pub mod services;
pub mod smtp;
pub mod storage;
pub mod utils;
pub mod validation;

use std::sync::Arc;

use authentication::DnsResolver;
use directory::StaticDirectory;
use services::{ContentScan, ReputationCheck};
use storage::MailStore;

// Re-export commonly used types
pub use config::Config;
pub use error::{GatewayError, Result};
pub use models::Mail;
pub use service::MailService;
pub use validation::{CheckFailure, ValidationError, Validator};

/// Wire the decision pipeline from configuration and external dependencies.
///
/// The recipient directory is the `[directory]` list.
pub fn build_mail_service(
    config: &Config,
    resolver: Arc<dyn DnsResolver>,
    reputation: Arc<dyn ReputationCheck>,
    scanner: Arc<dyn ContentScan>,
    store: Arc<dyn MailStore>,
) -> Arc<MailService> {
    let validator = Validator::new(resolver, reputation, scanner, store)
        .with_bypass_domain(config.validation.bypass_domain.clone());
    let directory = StaticDirectory::new(&config.directory.recipients);

    Arc::new(MailService::new(Arc::new(directory), Arc::new(validator)))
}
