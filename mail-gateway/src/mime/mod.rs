/// MIME message decoding
///
/// Turns the raw bytes received during DATA into a [`ParsedMessage`]:
/// header projections, text and HTML bodies, attachments and embedded files.
pub mod address;
pub mod encoding;
pub mod headers;
pub mod parser;
pub mod types;

use thiserror::Error;

pub use headers::Headers;
pub use parser::MimeParser;
pub use types::{Address, Attachment, EmbeddedFile, ParsedMessage};

#[derive(Error, Debug)]
pub enum MimeError {
    #[error("message has no header block")]
    MissingHeaders,

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid content type: {0:?}")]
    InvalidContentType(String),

    #[error("missing boundary parameter for {0}")]
    MissingBoundary(String),

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("unknown part {content_type:?} in {container}")]
    UnknownPart {
        container: &'static str,
        content_type: String,
    },

    #[error("unsupported transfer encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded payload is empty")]
    EmptyPayload,

    #[error("invalid address in {header}: {reason}")]
    InvalidAddress { header: String, reason: String },

    #[error("invalid date in {header}: {value:?}")]
    InvalidDate { header: String, value: String },

    #[error("multipart nesting deeper than {0} levels")]
    NestingTooDeep(usize),
}
