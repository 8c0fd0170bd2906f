//! Dummy SMTP - a capture-only SMTP server for tests
//!
//! Accepts a mail submission, answers with the minimal transcript a real
//! client expects, optionally upgrades the connection with STARTTLS, and
//! writes every message body verbatim to a local inbox directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌──────────────────────────────────────┐      ┌──────────────┐
//! │ Mail client │ SMTP │ Server ─▶ Session ─▶ LineCodec       │      │ inbox/*.eml  │
//! │  under test │─────▶│              │  └──▶ dispatch()      │─────▶│  log.txt     │
//! │             │◀─────│              └─────▶ TlsUpgrader     │      │              │
//! └─────────────┘      └──────────────────────────────────────┘      └──────────────┘
//! ```

pub mod client;
pub mod config;
pub mod idle;
pub mod mailbox;
pub mod proto;
pub mod server;
pub mod session;
pub mod tls;
pub mod transcript;

// Re-export commonly used items
pub use config::ServerConfig;
pub use mailbox::{ArtifactId, Mailbox};
pub use proto::LineCodec;
pub use server::Server;
pub use session::{Session, SessionEnd};
pub use tls::{
    CertificateHandle, CertificateProvider, DirectoryCertificateStore, StaticCertificateProvider,
    Thumbprint, TlsError, TlsUpgrader, Upgrade,
};
pub use transcript::Transcript;

use thiserror::Error;

/// Error types for Dummy SMTP
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Read timed out after {0:?} of inactivity")]
    Timeout(std::time::Duration),

    #[error("Line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("Failed to persist message: {0}")]
    Persistence(std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for Dummy SMTP
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
