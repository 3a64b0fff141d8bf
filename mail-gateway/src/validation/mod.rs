//! Decision stage
//!
//! Runs SPF, DKIM, DMARC, sender reputation and content scanning against a
//! [`Mail`], then files it in the mailbox of its recipient or in quarantine.
//! Every check runs regardless of earlier results; each failure becomes one
//! [`CheckFailure`] and the quarantine key is their joined rendering.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::authentication::{
    DkimValidator, DkimVerdict, DmarcValidator, DnsResolver, SpfResult, SpfValidator,
};
use crate::models::Mail;
use crate::services::{ContentScan, ReputationCheck};
use crate::storage::{MailStore, StorageError};
use crate::utils::{extract_domain, normalize_address};

const REASON_SEPARATOR: &str = "; ";

/// One failed check, with the diagnostic it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    InvalidSender(String),
    InvalidSenderIp(String),
    Spf {
        result: SpfResult,
        error: Option<String>,
    },
    Dkim {
        verdict: DkimVerdict,
        error: Option<String>,
    },
    /// Policy lookup failed or the domain publishes `p=reject`
    DmarcPolicy(String),
    /// Policy fetched but SPF or DKIM did not pass
    Dmarc { spf: SpfResult, dkim: DkimVerdict },
    Reputation(String),
    Scan(String),
}

impl CheckFailure {
    /// Short name for log fields
    pub fn check(&self) -> &'static str {
        match self {
            CheckFailure::InvalidSender(_) => "sender",
            CheckFailure::InvalidSenderIp(_) => "sender_ip",
            CheckFailure::Spf { .. } => "spf",
            CheckFailure::Dkim { .. } => "dkim",
            CheckFailure::DmarcPolicy(_) | CheckFailure::Dmarc { .. } => "dmarc",
            CheckFailure::Reputation(_) => "reputation",
            CheckFailure::Scan(_) => "scan",
        }
    }
}

fn detail(error: &Option<String>) -> &str {
    error.as_deref().unwrap_or("no error")
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::InvalidSender(sender) => write!(f, "invalid From address format: {}", sender),
            CheckFailure::InvalidSenderIp(ip) => write!(f, "invalid Sender IP address: {}", ip),
            CheckFailure::Spf { result, error } => {
                write!(f, "SPF check failed: {} ({})", result, detail(error))
            }
            CheckFailure::Dkim { verdict, error } => {
                write!(f, "DKIM verification failed: {} ({})", verdict, detail(error))
            }
            CheckFailure::DmarcPolicy(error) => write!(f, "DMARC policy check failed: {}", error),
            CheckFailure::Dmarc { spf, dkim } => {
                write!(f, "DMARC failed: SPF={}, DKIM={}", spf, dkim)
            }
            CheckFailure::Reputation(error) => write!(f, "reputation check failed: {}", error),
            CheckFailure::Scan(error) => write!(f, "content scan failed: {}", error),
        }
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    /// The mail was quarantined
    #[error("mail validation failed: {}", join_reasons(.0))]
    Rejected(Vec<CheckFailure>),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ValidationError {
    pub fn failures(&self) -> &[CheckFailure] {
        match self {
            ValidationError::Rejected(failures) => failures,
            ValidationError::Storage(_) => &[],
        }
    }
}

/// Quarantine key for a set of failures
pub fn join_reasons(failures: &[CheckFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(REASON_SEPARATOR)
}

/// Decision stage: verdicts in, mailbox or quarantine out
pub struct Validator {
    spf: SpfValidator,
    dkim: DkimValidator,
    dmarc: DmarcValidator,
    reputation: Arc<dyn ReputationCheck>,
    scanner: Arc<dyn ContentScan>,
    store: Arc<dyn MailStore>,
}

impl Validator {
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        reputation: Arc<dyn ReputationCheck>,
        scanner: Arc<dyn ContentScan>,
        store: Arc<dyn MailStore>,
    ) -> Self {
        Self {
            spf: SpfValidator::new(resolver.clone()),
            dkim: DkimValidator::new(resolver.clone()),
            dmarc: DmarcValidator::new(resolver),
            reputation,
            scanner,
            store,
        }
    }

    /// Skip SPF (from 127.0.0.1) and DKIM for mail from this domain.
    pub fn with_bypass_domain(mut self, domain: Option<String>) -> Self {
        self.spf = self.spf.with_bypass_domain(domain.clone());
        self.dkim = self.dkim.with_bypass_domain(domain);
        self
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// Validate `mail` and file it.
    ///
    /// Returns `Ok(())` when the mail was delivered, and
    /// [`ValidationError::Rejected`] when it was quarantined.
    pub async fn validate(&self, mail: Mail) -> Result<(), ValidationError> {
        let failures = self.run_checks(&mail).await;

        if failures.is_empty() {
            info!(
                id = %mail.id,
                sender = %mail.sender(),
                recipient = %mail.recipient,
                "All checks passed, delivering"
            );
            self.store.deliver(mail).await?;
            return Ok(());
        }

        let reason = join_reasons(&failures);
        warn!(
            id = %mail.id,
            sender = %mail.sender(),
            recipient = %mail.recipient,
            %reason,
            "Quarantining mail"
        );
        self.store.quarantine(&reason, mail).await?;
        Err(ValidationError::Rejected(failures))
    }

    async fn run_checks(&self, mail: &Mail) -> Vec<CheckFailure> {
        let sender = normalize_address(mail.sender());
        let domain = match extract_domain(&sender) {
            Ok(domain) => domain,
            Err(_) => {
                warn!(%sender, "Sender has no usable domain");
                return vec![CheckFailure::InvalidSender(sender)];
            }
        };
        let ip: IpAddr = match mail.sender_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(sender_ip = %mail.sender_ip, "Sender IP is not an IP address");
                return vec![CheckFailure::InvalidSenderIp(mail.sender_ip.clone())];
            }
        };

        let mut failures = Vec::new();

        // The SPF HELO identity is not tracked, so the sender domain stands in
        let (spf, spf_error) = match self.spf.check(ip, &sender, &domain).await {
            Ok(result) => (result, None),
            Err(e) => (e.result(), Some(e.to_string())),
        };
        if spf == SpfResult::Pass && spf_error.is_none() {
            info!(check = "spf", %spf, %sender, %ip, %domain, "Check passed");
        } else {
            warn!(check = "spf", %spf, %sender, %ip, %domain, error = ?spf_error, "Check failed");
            failures.push(CheckFailure::Spf {
                result: spf,
                error: spf_error,
            });
        }

        let dkim = match self.dkim.verify(&mail.raw_message).await {
            Ok(DkimVerdict::Pass) => {
                info!(check = "dkim", "Check passed");
                DkimVerdict::Pass
            }
            Ok(verdict) => {
                warn!(check = "dkim", %verdict, "Check failed");
                failures.push(CheckFailure::Dkim {
                    verdict,
                    error: None,
                });
                verdict
            }
            Err(e) => {
                let verdict = e.verdict();
                warn!(check = "dkim", %verdict, error = %e, "Check failed");
                failures.push(CheckFailure::Dkim {
                    verdict,
                    error: Some(e.to_string()),
                });
                verdict
            }
        };

        match self.dmarc.fetch_policy(&domain).await {
            Err(e) => {
                warn!(check = "dmarc", %domain, error = %e, "Policy check failed");
                failures.push(CheckFailure::DmarcPolicy(e.to_string()));
            }
            Ok(_) if spf != SpfResult::Pass || dkim != DkimVerdict::Pass => {
                warn!(check = "dmarc", %domain, %spf, %dkim, "Check failed");
                failures.push(CheckFailure::Dmarc { spf, dkim });
            }
            Ok(_) => info!(check = "dmarc", %domain, "Check passed"),
        }

        match self.reputation.check(ip).await {
            Ok(()) => info!(check = "reputation", %ip, "Check passed"),
            Err(e) => {
                warn!(check = "reputation", %ip, error = %e, "Check failed");
                failures.push(CheckFailure::Reputation(e.to_string()));
            }
        }

        let message = &mail.message;
        match self
            .scanner
            .scan(&message.attachments, &message.embedded_files)
            .await
        {
            Ok(()) => info!(check = "scan", "Check passed"),
            Err(e) => {
                warn!(check = "scan", error = %e, "Check failed");
                failures.push(CheckFailure::Scan(e.to_string()));
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authentication::StaticResolver;
    use crate::mime::{Attachment, EmbeddedFile, MimeParser};
    use crate::services::{ReputationError, ScanError};
    use crate::storage::InMemoryMailStore;
    use async_trait::async_trait;

    struct FixedReputation(bool);

    #[async_trait]
    impl ReputationCheck for FixedReputation {
        async fn check(&self, ip: IpAddr) -> Result<(), ReputationError> {
            if self.0 {
                Ok(())
            } else {
                Err(ReputationError::Flagged { ip, score: 100 })
            }
        }
    }

    struct FixedScan(bool);

    #[async_trait]
    impl ContentScan for FixedScan {
        async fn scan(&self, _: &[Attachment], _: &[EmbeddedFile]) -> Result<(), ScanError> {
            if self.0 {
                Ok(())
            } else {
                Err(ScanError::Flagged {
                    name: "x.exe".to_string(),
                    malicious: 1,
                    suspicious: 0,
                })
            }
        }
    }

    const RAW: &[u8] = b"From: Alice <alice@test.com>\r\n\
To: bob@example.com\r\n\
Subject: hi\r\n\
DKIM-Signature: v=1; a=rsa-sha256; d=test.com; s=sel; h=from; b=AAAA\r\n\
\r\n\
hello\r\n";

    fn mail(sender_ip: &str) -> Mail {
        let message = MimeParser::parse(RAW).unwrap();
        Mail::new(message, RAW.to_vec()).for_recipient("bob@example.com", sender_ip)
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new()
            .with_txt("test.com", "v=spf1 ip4:203.0.113.0/24 -all")
            .with_txt("_dmarc.test.com", "v=DMARC1; p=none")
    }

    fn validator(resolver: StaticResolver, reputation: bool, scan: bool) -> Validator {
        Validator::new(
            Arc::new(resolver),
            Arc::new(FixedReputation(reputation)),
            Arc::new(FixedScan(scan)),
            Arc::new(InMemoryMailStore::new()),
        )
        .with_bypass_domain(Some("test.com".to_string()))
    }

    #[tokio::test]
    async fn test_all_checks_pass_delivers() {
        let validator = validator(resolver(), true, true);
        validator.validate(mail("203.0.113.5")).await.unwrap();

        let delivered = validator.store().mails_for("bob@example.com").await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(validator.store().blocked_mails().await.is_empty());
    }

    #[tokio::test]
    async fn test_reputation_only_failure_quarantines() {
        let validator = validator(resolver(), false, true);
        let err = validator.validate(mail("203.0.113.5")).await.unwrap_err();

        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].check(), "reputation");

        let blocked = validator.store().blocked_mails().await;
        assert_eq!(blocked.len(), 1);
        let reason = blocked.keys().next().unwrap();
        assert!(reason.starts_with("reputation check failed"));
        assert!(validator.store().mails_for("bob@example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_failures_accumulate() {
        let validator = validator(resolver(), false, false);
        let err = validator.validate(mail("198.51.100.1")).await.unwrap_err();

        let checks: Vec<&str> = err.failures().iter().map(CheckFailure::check).collect();
        assert_eq!(checks, vec!["spf", "dmarc", "reputation", "scan"]);
        assert_eq!(
            err.failures()[0],
            CheckFailure::Spf {
                result: SpfResult::Fail,
                error: None
            }
        );
        assert_eq!(
            err.failures()[1].to_string(),
            "DMARC failed: SPF=fail, DKIM=pass"
        );

        let blocked = validator.store().blocked_mails().await;
        let reason = blocked.keys().next().unwrap();
        assert_eq!(reason.matches(REASON_SEPARATOR).count(), 3);
    }

    #[tokio::test]
    async fn test_missing_dmarc_record_fails_closed() {
        let resolver = StaticResolver::new().with_txt("test.com", "v=spf1 +all");
        let validator = validator(resolver, true, true);
        let err = validator.validate(mail("203.0.113.5")).await.unwrap_err();

        assert!(matches!(err.failures(), [CheckFailure::DmarcPolicy(_)]));
    }

    #[tokio::test]
    async fn test_invalid_sender_ip_quarantined() {
        let validator = validator(resolver(), true, true);
        let err = validator.validate(mail("not-an-ip")).await.unwrap_err();

        assert_eq!(
            err.failures(),
            &[CheckFailure::InvalidSenderIp("not-an-ip".to_string())]
        );
        let blocked = validator.store().blocked_mails().await;
        assert!(blocked.contains_key("invalid Sender IP address: not-an-ip"));
    }

    #[test]
    fn test_failure_rendering() {
        let spf = CheckFailure::Spf {
            result: SpfResult::TempError,
            error: Some("DNS lookup failed: timeout".to_string()),
        };
        assert_eq!(
            spf.to_string(),
            "SPF check failed: temperror (DNS lookup failed: timeout)"
        );

        let dkim = CheckFailure::Dkim {
            verdict: DkimVerdict::None,
            error: None,
        };
        assert_eq!(dkim.to_string(), "DKIM verification failed: none (no error)");

        let err = ValidationError::Rejected(vec![spf, dkim]);
        assert!(err.to_string().starts_with("mail validation failed: SPF check failed"));
    }
}
