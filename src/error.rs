//! Error types for Keystone

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::enrollment::EnrollmentError;
use crate::node::NodeError;
use crate::pki::PkiError;
use crate::transport::TransportError;

/// Main error type for Keystone operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Certificate authority or certificate handling error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Enrollment request failed
    #[error("enrollment error: {0}")]
    Enrollment(#[from] EnrollmentError),

    /// Node directory error
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Connection pool or mTLS transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Node-side enrollment error
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// Startup configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
