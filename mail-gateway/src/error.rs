use thiserror::Error;

use crate::mime::MimeError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Message parse error: {0}")]
    Parse(#[from] MimeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
