//! Utility modules
//!
//! - [`email`]: Email address validation (RFC 5321) and domain extraction

pub mod email;

pub use email::{extract_domain, normalize_address, validate_email};
