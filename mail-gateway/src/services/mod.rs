//! Outbound checks against external HTTP services
//!
//! - [`reputation`]: sender IP abuse score lookup
//! - [`scanner`]: malware scanning of attachments and embedded files

pub mod reputation;
pub mod scanner;

use async_trait::async_trait;
use std::net::IpAddr;

use crate::mime::{Attachment, EmbeddedFile};

pub use reputation::{AbuseIpDbClient, ReputationError};
pub use scanner::{ScanError, VirusTotalClient};

/// Sender IP reputation lookup. `Ok(())` means the IP is acceptable.
#[async_trait]
pub trait ReputationCheck: Send + Sync {
    async fn check(&self, ip: IpAddr) -> Result<(), ReputationError>;
}

/// Malware scan of every non-empty payload. Stops at the first detection.
#[async_trait]
pub trait ContentScan: Send + Sync {
    async fn scan(
        &self,
        attachments: &[Attachment],
        embedded: &[EmbeddedFile],
    ) -> Result<(), ScanError>;
}
