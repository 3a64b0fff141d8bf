//! Mail storage
//!
//! - [`memory`]: process-lifetime mailbox and quarantine maps

pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::Mail;

pub use memory::InMemoryMailStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("mail {0} has no recipient")]
    MissingRecipient(uuid::Uuid),

    #[error("quarantine reason is empty")]
    EmptyReason,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Accepted mail by recipient, quarantined mail by failure reason.
///
/// Both sides are append-only and keep insertion order per key.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn deliver(&self, mail: Mail) -> Result<(), StorageError>;

    async fn quarantine(&self, reason: &str, mail: Mail) -> Result<(), StorageError>;

    /// `None` when nothing was ever delivered to `recipient`.
    async fn mails_for(&self, recipient: &str) -> Option<Vec<Mail>>;

    async fn all_mails(&self) -> Vec<Mail>;

    async fn blocked_mails(&self) -> BTreeMap<String, Vec<Mail>>;
}
