use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mime::ParsedMessage;

/// One stored copy of a message, filed under a single recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    pub id: Uuid,
    pub message: ParsedMessage,
    /// `Date` header, or the receive time when absent
    pub date: DateTime<FixedOffset>,
    pub raw_message: Vec<u8>,
    pub sender_ip: String,
    pub recipient: String,
    pub received_at: DateTime<Utc>,
}

impl Mail {
    /// Build the per-message template; sender IP and recipient are stamped later.
    pub fn new(message: ParsedMessage, raw_message: Vec<u8>) -> Self {
        let received_at = Utc::now();
        let date = message
            .date
            .unwrap_or_else(|| received_at.into());

        Mail {
            id: Uuid::new_v4(),
            message,
            date,
            raw_message,
            sender_ip: String::new(),
            recipient: String::new(),
            received_at,
        }
    }

    /// Copy of this template for one recipient, with a fresh id.
    pub fn for_recipient(&self, recipient: &str, sender_ip: &str) -> Mail {
        let mut mail = self.clone();
        mail.id = Uuid::new_v4();
        mail.recipient = recipient.to_string();
        mail.sender_ip = sender_ip.to_string();
        mail
    }

    /// First `From` address, empty when the message has none.
    pub fn sender(&self) -> &str {
        self.message.first_from().unwrap_or("")
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{Address, MimeParser};

    #[test]
    fn test_date_defaults_to_receive_time() {
        let mail = Mail::new(ParsedMessage::default(), Vec::new());
        assert_eq!(mail.date, DateTime::<FixedOffset>::from(mail.received_at));
        assert_eq!(mail.sender(), "");
    }

    #[test]
    fn test_date_from_header() {
        let raw = b"From: a@b.c\r\nDate: Mon, 02 Jan 2006 15:04:05 -0700\r\n\r\nx".to_vec();
        let parsed = MimeParser::parse(&raw).unwrap();
        let mail = Mail::new(parsed, raw.clone());
        let expected = DateTime::parse_from_rfc2822("Mon, 02 Jan 2006 15:04:05 -0700").unwrap();
        assert_eq!(mail.date, expected);
        assert_eq!(mail.raw_message, raw);
    }

    #[test]
    fn test_for_recipient_stamps_copy() {
        let message = ParsedMessage {
            from: vec![Address::new("alice@example.com")],
            ..Default::default()
        };
        let template = Mail::new(message, b"raw".to_vec());
        let copy = template.for_recipient("bob@example.org", "203.0.113.5");

        assert_ne!(copy.id, template.id);
        assert_eq!(copy.recipient, "bob@example.org");
        assert_eq!(copy.sender_ip, "203.0.113.5");
        assert_eq!(copy.sender(), "alice@example.com");
        assert!(template.recipient.is_empty());
    }
}
