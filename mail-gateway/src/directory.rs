//! Recipient directory
//!
//! The gateway only accepts mail for addresses the directory knows about.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::utils::normalize_address;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipient_exists(&self, address: &str) -> bool;
}

/// Fixed set of addresses, compared after normalization
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    recipients: HashSet<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            recipients: recipients
                .into_iter()
                .map(|r| normalize_address(r.as_ref()))
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn recipient_exists(&self, address: &str) -> bool {
        self.recipients.contains(&normalize_address(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_is_normalized() {
        let directory = StaticDirectory::new(["Alice@Example.com", " bob@example.com ", ""]);
        assert_eq!(directory.len(), 2);

        assert!(directory.recipient_exists("alice@example.com").await);
        assert!(directory.recipient_exists("<ALICE@example.com>").await);
        assert!(directory.recipient_exists("bob@example.com").await);
        assert!(!directory.recipient_exists("carol@example.com").await);
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let directory = StaticDirectory::default();
        assert!(directory.is_empty());
        assert!(!directory.recipient_exists("alice@example.com").await);
    }
}
