//! Gadget error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by descriptor validation, the device session and endpoint I/O
#[derive(Debug, Error)]
pub enum GadgetError {
    /// The descriptor model is malformed; nothing was registered with the kernel
    #[error("Invalid descriptor: {0}")]
    Validation(String),

    /// The kernel rejected the descriptors or the device could not be opened
    #[error("Failed to open gadget: {reason}")]
    Open {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Endpoint is not enabled under the active configuration (or its handle was closed)
    #[error("Endpoint {0} is not enabled")]
    EndpointNotEnabled(u8),

    /// Blocking I/O exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Write accepted fewer bytes than requested
    #[error("Short write: {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },

    /// Control notification could not be decoded
    #[error("Undecodable control notification: {0}")]
    Decode(String),

    /// Blocking call interrupted by an explicit cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Session was already closed
    #[error("Session is closed")]
    SessionClosed,

    /// Hard I/O failure on a channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GadgetError {
    pub(crate) fn open(reason: impl Into<String>, source: std::io::Error) -> Self {
        Self::Open {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Whether the caller may simply retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<nix::errno::Errno> for GadgetError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from(errno))
    }
}

/// Type alias for gadget results
pub type Result<T> = std::result::Result<T, GadgetError>;
