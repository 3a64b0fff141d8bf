use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::headers::Headers;

/// A mailbox: optional display name plus addr-spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Address {
            name: None,
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "\"{}\" <{}>", name.replace('"', "\\\""), self.address),
            None => write!(f, "<{}>", self.address),
        }
    }
}

/// A part carrying a filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// An inline resource referenced by Content-ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedFile {
    pub content_id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Structured form of a raw RFC 5322 message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    /// All headers, encoded-words decoded
    pub headers: Headers,

    pub subject: String,
    pub from: Vec<Address>,
    pub sender: Option<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub date: Option<DateTime<FixedOffset>>,
    pub message_id: String,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,

    pub resent_from: Vec<Address>,
    pub resent_sender: Option<Address>,
    pub resent_to: Vec<Address>,
    pub resent_cc: Vec<Address>,
    pub resent_bcc: Vec<Address>,
    pub resent_date: Option<DateTime<FixedOffset>>,
    pub resent_message_id: String,

    /// Top-level media type
    pub content_type: String,
    /// Decoded top-level payload when it is neither text nor multipart
    pub content: Vec<u8>,

    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
    pub embedded_files: Vec<EmbeddedFile>,
}

impl ParsedMessage {
    /// Address of the first `From` mailbox.
    pub fn first_from(&self) -> Option<&str> {
        self.from.first().map(|a| a.address.as_str())
    }

    pub fn total_attachment_size(&self) -> usize {
        self.attachments.iter().map(|a| a.data.len()).sum::<usize>()
            + self.embedded_files.iter().map(|e| e.data.len()).sum::<usize>()
    }
}
