//! Error types for plex.
//!
//! Two layers of failure exist and never mix:
//!
//! - [`ErrorCode`] + failure envelopes travel on the wire and are returned
//!   to callers as ordinary values.
//! - [`PlexError`] is thrown (returned as `Err`) only for catastrophic
//!   preconditions: payload too large before send, route limit hit before
//!   send, transport death, pool exhaustion.

use thiserror::Error;

/// Main error type for all plex operations.
#[derive(Debug, Error)]
pub enum PlexError {
    /// Protocol violation (malformed frame, unexpected state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying transport closed or died.
    #[error("connection closed")]
    ConnectionClosed,

    /// A call failed before reaching the wire, with a wire error code.
    #[error("{}: {message}", code.as_str())]
    Call {
        /// Wire-level error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// The pool has no eligible peer for this call.
    #[error("PeerPool: no peers available")]
    NoPeers,

    /// The duplex pending-write queue is full.
    #[error("write buffer full")]
    BufferFull,
}

impl PlexError {
    /// Build a code-carrying call error.
    pub fn call(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Call {
            code,
            message: message.into(),
        }
    }

    /// The wire error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Call { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias using PlexError.
pub type Result<T> = std::result::Result<T, PlexError>;

/// Closed set of error codes carried in failure envelopes.
///
/// Senders must not invent new strings; receivers map unknown strings to
/// [`ErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorCode {
    BadArg,
    CodecError,
    CasFailed,
    CapabilityDenied,
    Timeout,
    DriverError,
    CryptoError,
    NotAvailable,
    NotReady,
    PayloadTooLarge,
    Closed,
    Destroyed,
    Unknown,
}

impl ErrorCode {
    /// Wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadArg => "BadArg",
            Self::CodecError => "CodecError",
            Self::CasFailed => "CASFailed",
            Self::CapabilityDenied => "CapabilityDenied",
            Self::Timeout => "Timeout",
            Self::DriverError => "DriverError",
            Self::CryptoError => "CryptoError",
            Self::NotAvailable => "NotAvailable",
            Self::NotReady => "NotReady",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::Closed => "Closed",
            Self::Destroyed => "Destroyed",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a wire string; unknown strings collapse to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "BadArg" => Self::BadArg,
            "CodecError" => Self::CodecError,
            "CASFailed" => Self::CasFailed,
            "CapabilityDenied" => Self::CapabilityDenied,
            "Timeout" => Self::Timeout,
            "DriverError" => Self::DriverError,
            "CryptoError" => Self::CryptoError,
            "NotAvailable" => Self::NotAvailable,
            "NotReady" => Self::NotReady,
            "PayloadTooLarge" => Self::PayloadTooLarge,
            "Closed" => Self::Closed,
            "Destroyed" => Self::Destroyed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
