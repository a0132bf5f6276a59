//! Error types for the framelink transport.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! Connection-fatal conditions are additionally reported once through the
//! close callback as a [`CloseReason`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for framelink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Framing Errors ───────────────────────────────────────────
    /// Received bytes that do not start with the frame magic.
    #[error("invalid magic bytes: expected FLK0")]
    InvalidMagic,

    /// A field in the frame header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection loop is gone; its command channel is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation was attempted in a lifecycle state that forbids it.
    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),

    // ── Request Errors ───────────────────────────────────────────
    /// The request could not be written to the connection.
    #[error("send request failed: {0}")]
    SendFailed(String),

    /// A request with the same id is already waiting for a reply.
    #[error("request {0} is already pending")]
    DuplicateRequest(u64),

    /// The peer answered the request with a rejection.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No reply arrived before the request deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The connection carrying the request was torn down.
    #[error("connection reset")]
    ConnectionReset,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a typed body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        LinkError::Other(s)
    }
}

impl From<&str> for LinkError {
    fn from(s: &str) -> Self {
        LinkError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ConnectionClosed
    }
}

impl From<Box<bincode::ErrorKind>> for LinkError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LinkError::Encoding(e.to_string())
    }
}

// ── CloseReason ───────────────────────────────────────────────────

/// Why a connection reached `Closed`. Passed to the close callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream (zero-byte first read).
    PeerClosed,
    /// A read or write failed; carries the system error text.
    Io { kind: std::io::ErrorKind, message: String },
    /// The inbound byte stream held a malformed frame.
    Decode(String),
    /// The owner asked for the connection to be shut down.
    Shutdown,
}

impl CloseReason {
    pub(crate) fn io(err: &std::io::Error) -> Self {
        CloseReason::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Numeric reason code: `0` for an orderly close, negative for faults.
    pub fn code(&self) -> i32 {
        match self {
            CloseReason::PeerClosed | CloseReason::Shutdown => 0,
            CloseReason::Io { .. } => -1,
            CloseReason::Decode(_) => -2,
        }
    }

    /// `true` for the closes that are not caused by a fault.
    pub fn is_orderly(&self) -> bool {
        self.code() == 0
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Io { message, .. } => write!(f, "i/o error: {message}"),
            CloseReason::Decode(msg) => write!(f, "decode error: {msg}"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = LinkError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = LinkError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = LinkError::Rejected("no such method".into());
        assert!(e.to_string().contains("no such method"));
    }

    #[test]
    fn from_string() {
        let e: LinkError = "something broke".into();
        assert!(matches!(e, LinkError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: LinkError = io_err.into();
        assert!(matches!(e, LinkError::Io(_)));
    }

    #[test]
    fn close_reason_codes() {
        assert_eq!(CloseReason::PeerClosed.code(), 0);
        assert!(CloseReason::Shutdown.is_orderly());

        let io = CloseReason::io(&std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(io.code(), -1);
        assert!(io.to_string().contains("reset by peer"));
        assert!(!CloseReason::Decode("bad magic".into()).is_orderly());
    }
}
