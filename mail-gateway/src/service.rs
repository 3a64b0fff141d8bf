//! Mail service
//!
//! Entry point for accepted mail and read access for the management side.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::RecipientDirectory;
use crate::models::Mail;
use crate::storage::MailStore;
use crate::validation::{ValidationError, Validator};

pub struct MailService {
    directory: Arc<dyn RecipientDirectory>,
    validator: Arc<Validator>,
}

impl MailService {
    pub fn new(directory: Arc<dyn RecipientDirectory>, validator: Arc<Validator>) -> Self {
        Self {
            directory,
            validator,
        }
    }

    fn store(&self) -> &Arc<dyn MailStore> {
        self.validator.store()
    }

    /// Validate and file `mail` for `recipient`.
    ///
    /// Unknown recipients are dropped silently. Quarantine is an outcome, not
    /// an error; only a failed store write is logged as one.
    pub async fn add_mail(&self, recipient: &str, mail: Mail, sender_ip: &str) {
        debug!(%recipient, "Adding mail");
        if !self.exist_user_by_mail(recipient).await {
            debug!(%recipient, "Unknown recipient, dropping mail");
            return;
        }

        let mut mail = mail;
        mail.recipient = recipient.to_string();
        mail.sender_ip = sender_ip.to_string();

        match self.validator.validate(mail).await {
            Ok(()) => info!(%recipient, "Mail delivered"),
            Err(ValidationError::Rejected(failures)) => {
                warn!(%recipient, failures = failures.len(), "Mail quarantined")
            }
            Err(e) => tracing::error!(%recipient, error = %e, "Failed to store mail"),
        }
    }

    /// `None` when nothing was ever delivered to `recipient`.
    pub async fn get_mail_by_recipient(&self, recipient: &str) -> Option<Vec<Mail>> {
        self.store().mails_for(recipient).await
    }

    pub async fn get_all_mails(&self) -> Vec<Mail> {
        self.store().all_mails().await
    }

    pub async fn get_blocked_mails(&self) -> BTreeMap<String, Vec<Mail>> {
        self.store().blocked_mails().await
    }

    pub async fn exist_user_by_mail(&self, address: &str) -> bool {
        self.directory.recipient_exists(address).await
    }
}
