//! Security module
//!
//! - [`tls`]: STARTTLS configuration and handshake acceptor

pub mod tls;

pub use tls::TlsConfig;
