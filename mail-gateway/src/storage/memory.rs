use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{MailStore, StorageError};
use crate::models::Mail;
use crate::utils::normalize_address;

/// Memory-resident store. Each map sits behind its own reader/writer lock.
#[derive(Default)]
pub struct InMemoryMailStore {
    mailboxes: RwLock<BTreeMap<String, Vec<Mail>>>,
    quarantine: RwLock<BTreeMap<String, Vec<Mail>>>,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MailStore for InMemoryMailStore {
    async fn deliver(&self, mail: Mail) -> Result<(), StorageError> {
        let key = normalize_address(&mail.recipient);
        if key.is_empty() {
            return Err(StorageError::MissingRecipient(mail.id));
        }

        let mut mailboxes = self.mailboxes.write().await;
        let mailbox = mailboxes.entry(key).or_default();
        mailbox.push(mail);
        debug!(size = mailbox.len(), "Appended to mailbox");
        Ok(())
    }

    async fn quarantine(&self, reason: &str, mail: Mail) -> Result<(), StorageError> {
        if reason.is_empty() {
            return Err(StorageError::EmptyReason);
        }

        let mut quarantine = self.quarantine.write().await;
        quarantine.entry(reason.to_string()).or_default().push(mail);
        Ok(())
    }

    async fn mails_for(&self, recipient: &str) -> Option<Vec<Mail>> {
        let mailboxes = self.mailboxes.read().await;
        mailboxes.get(&normalize_address(recipient)).cloned()
    }

    async fn all_mails(&self) -> Vec<Mail> {
        let mailboxes = self.mailboxes.read().await;
        mailboxes.values().flatten().cloned().collect()
    }

    async fn blocked_mails(&self) -> BTreeMap<String, Vec<Mail>> {
        self.quarantine.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::ParsedMessage;
    use std::sync::Arc;

    fn mail_to(recipient: &str, subject: &str) -> Mail {
        let message = ParsedMessage {
            subject: subject.to_string(),
            ..Default::default()
        };
        Mail::new(message, Vec::new()).for_recipient(recipient, "127.0.0.1")
    }

    #[tokio::test]
    async fn test_deliver_keeps_insertion_order() {
        let store = InMemoryMailStore::new();
        store.deliver(mail_to("bob@example.org", "X")).await.unwrap();
        store.deliver(mail_to("Bob@Example.org", "Y")).await.unwrap();

        let mails = store.mails_for("<bob@example.org>").await.unwrap();
        let subjects: Vec<_> = mails.iter().map(|m| m.subject()).collect();
        assert_eq!(subjects, ["X", "Y"]);
    }

    #[tokio::test]
    async fn test_unknown_mailbox_is_none() {
        let store = InMemoryMailStore::new();
        assert!(store.mails_for("nobody@example.org").await.is_none());
        assert!(store.all_mails().await.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_requires_recipient() {
        let store = InMemoryMailStore::new();
        let mail = Mail::new(ParsedMessage::default(), Vec::new());
        assert!(matches!(
            store.deliver(mail).await,
            Err(StorageError::MissingRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_quarantine_by_reason() {
        let store = InMemoryMailStore::new();
        store
            .quarantine("SPF check failed: fail", mail_to("a@x.org", "1"))
            .await
            .unwrap();
        store
            .quarantine("SPF check failed: fail", mail_to("b@x.org", "2"))
            .await
            .unwrap();
        assert!(store.quarantine("", mail_to("c@x.org", "3")).await.is_err());

        let blocked = store.blocked_mails().await;
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked["SPF check failed: fail"].len(), 2);
        assert!(store.all_mails().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let store = Arc::new(InMemoryMailStore::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .deliver(mail_to("bob@example.org", &i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.mails_for("bob@example.org").await.unwrap().len(), 20);
        assert_eq!(store.all_mails().await.len(), 20);
    }
}
