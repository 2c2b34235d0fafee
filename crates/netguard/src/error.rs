use std::fmt;

/// Unified error type for the netguard crate.
#[derive(Debug, Clone)]
pub enum Error {
    /// Identity mismatch or missing consent. Never retried; the caller must
    /// re-provision or obtain consent before trying again.
    Security(String),
    /// Invalid or absent configuration. Rejected before any state changes.
    Config(String),
    /// Tunnel negotiation failed; the session has been rolled back.
    Negotiation(String),
    /// Internal error.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Security(msg) => write!(f, "security fault: {msg}"),
            Error::Config(msg) => write!(f, "configuration fault: {msg}"),
            Error::Negotiation(msg) => write!(f, "negotiation failure: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias using [`Error`].
pub type NetResult<T> = Result<T, Error>;
