//! Inbound SMTP (RFC 5321)
//!
//! - [`server`]: accept loop with graceful shutdown
//! - [`session`]: per-connection state machine, STARTTLS and recipient fan-out
//! - [`commands`]: command line parsing

pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::{SessionSettings, SmtpSession};
