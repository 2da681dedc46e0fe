//! Error types for the ingest server, the relay client and everything in between
//!
//! Every fallible operation in the crate returns [`Result`]. Errors never
//! cross a session boundary: a failing ingest session or relay session logs
//! its error and tears itself down without touching anyone else.

use std::io;

use thiserror::Error;

use crate::registry::RegistryError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// A peer declared a message larger than we are willing to buffer
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    ResourceLimitExceeded { size: usize, limit: usize },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Whether a relay session should back off and try again after this error
    ///
    /// Rejections by the remote platform and malformed target URLs are
    /// terminal; transport and protocol failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Relay(e) => e.is_retryable(),
            Error::Rejected(_) => false,
            _ => true,
        }
    }
}

/// Handshake failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    #[error("C2 does not echo S1")]
    EchoMismatch,

    #[error("handshake timed out")]
    Timeout,

    #[error("peer closed the connection mid-handshake")]
    Truncated,
}

/// Chunk stream and session sequencing violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("chunk stream {0} used a compressed header with no previous header")]
    MissingPreviousHeader(u32),

    #[error("chunk stream {0} started a new message while one was in flight")]
    InterleavedHeader(u32),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("malformed message type {message_type}: {reason}")]
    MalformedMessage { message_type: u8, reason: &'static str },

    #[error("unexpected {command} while {phase}")]
    UnexpectedCommand { command: String, phase: &'static str },

    #[error("invalid stream key {0:?}")]
    InvalidStreamKey(String),

    #[error("unknown application {0:?}")]
    InvalidApp(String),
}

/// AMF0 decoding failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    #[error("AMF nesting too deep")]
    NestingTooDeep,

    #[error("invalid AMF reference {0}")]
    InvalidReference(u16),

    #[error("missing AMF object end marker")]
    InvalidObjectEnd,
}

/// Outbound relay failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Transport level: DNS, TCP connect, handshake, reset
    #[error("could not reach target: {0}")]
    Connect(String),

    /// The target answered but refused our connect or publish
    #[error("target rejected the stream: {0}")]
    Auth(String),

    #[error("invalid target URL {0:?}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).is_retryable());
        assert!(Error::from(RelayError::Connect("refused".into())).is_retryable());
        assert!(!Error::from(RelayError::Auth("bad key".into())).is_retryable());
        assert!(!Error::from(RelayError::UnsupportedScheme("rtmps".into())).is_retryable());
        assert!(!Error::Rejected("nope".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::ResourceLimitExceeded {
            size: 9_000_000,
            limit: 8_388_608,
        };
        assert!(err.to_string().contains("9000000"));

        let err = Error::from(ProtocolError::MissingPreviousHeader(5));
        assert!(err.to_string().contains("chunk stream 5"));
    }
}
