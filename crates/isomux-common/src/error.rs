//! Error types for isomux.

use std::io;
use thiserror::Error;

/// Result type for isomux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the isomux workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The parser saw no further syncframes or NAL units.
    #[error("end of stream")]
    EndOfStream,

    /// Lost resynchronization in a framed stream (recoverable).
    #[error("lost sync: {0}")]
    Sync(String),

    /// Malformed elementary stream.
    #[error("malformed elementary stream: {0}")]
    Es(String),

    /// A referenced parameter set is undefined and so is id 0.
    #[error("no configuration available: {0}")]
    NoConfig(String),

    /// A configuration change the container cannot represent.
    #[error("unsupported configuration change: {0}")]
    ConfigChange(String),

    /// User configuration rejected.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// A stream produced zero samples at finalize time.
    #[error("stream produced no samples")]
    EmptyStream,

    /// A feature the library does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Internal consistency violation detected post-assembly.
    #[error("internal consistency violation: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-stream error.
    pub fn es(msg: impl Into<String>) -> Self {
        Self::Es(msg.into())
    }

    /// Create a lost-sync error.
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create an invalid-parameter error.
    pub fn param(msg: impl Into<String>) -> Self {
        Self::Param(msg.into())
    }

    /// Create an unsupported-feature error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an internal-invariant error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the error is a clean end-of-stream, as opposed to a
    /// real I/O failure.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            Self::EndOfStream => true,
            Self::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
