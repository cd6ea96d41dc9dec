//! Domain-specific error types for the SPICE channel engine.
//!
//! All fallible operations return `Result<T, SpiceError>`. A fatal error
//! inside a channel task is reported to the session exactly once, as the
//! [`ChannelEvent`] returned by [`SpiceError::channel_event`].

use thiserror::Error;

use crate::event::ChannelEvent;
use crate::message::LinkErrorCode;

/// The canonical error type for the channel engine.
#[derive(Debug, Error)]
pub enum SpiceError {
    // ── Setup Errors ─────────────────────────────────────────────
    /// The channel is missing its session, kind or id.
    #[error("channel setup incomplete: {0}")]
    SetupIncomplete(&'static str),

    /// A configuration value could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Link Errors ──────────────────────────────────────────────
    /// The peer's link header did not start with the SPICE magic.
    #[error("invalid link magic: {0:#010x}")]
    InvalidMagic(u32),

    /// The peer speaks a different major protocol version.
    #[error("protocol version mismatch: peer speaks {major}.{minor}")]
    VersionMismatch { major: u32, minor: u32 },

    /// The peer's link reply carried a non-OK error code.
    #[error("link rejected by peer: {0}")]
    LinkRejected(LinkErrorCode),

    /// A link structure was malformed or truncated.
    #[error("link error: {0}")]
    Link(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The transport could not be established.
    #[error("connect error: {0}")]
    Connect(String),

    /// The TLS handshake or certificate verification failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The transport reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Eof,

    // ── Authentication Errors ────────────────────────────────────
    /// The peer rejected our credentials or the ticket could not be built.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A SASL exchange was malformed, oversized or too weak.
    #[error("sasl error: {0}")]
    Sasl(String),

    // ── Message Errors ───────────────────────────────────────────
    /// A received message could not be decoded as its declared type.
    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The declared message size exceeds the codec limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Runtime Errors ───────────────────────────────────────────
    /// An internal channel (mpsc/oneshot) closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl SpiceError {
    /// Shorthand for a [`SpiceError::Parse`] error.
    pub fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        SpiceError::Parse {
            what,
            reason: reason.into(),
        }
    }

    /// The notification a channel surfaces when this error ends it.
    ///
    /// `ready` tells whether the channel had completed its handshake; a
    /// transport failure before that point is a link failure.
    pub fn channel_event(&self, ready: bool) -> ChannelEvent {
        match self {
            SpiceError::SetupIncomplete(_) | SpiceError::Config(_) | SpiceError::Connect(_) => {
                ChannelEvent::ErrorConnect
            }
            SpiceError::Tls(_) => ChannelEvent::ErrorTls,
            SpiceError::InvalidMagic(_)
            | SpiceError::VersionMismatch { .. }
            | SpiceError::LinkRejected(_)
            | SpiceError::Link(_) => ChannelEvent::ErrorLink,
            SpiceError::Auth(_) | SpiceError::Sasl(_) => ChannelEvent::ErrorAuth,
            SpiceError::Io(_) | SpiceError::Eof if !ready => ChannelEvent::ErrorLink,
            _ => ChannelEvent::ErrorIo,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for SpiceError {
    fn from(s: String) -> Self {
        SpiceError::Other(s)
    }
}

impl From<&str> for SpiceError {
    fn from(s: &str) -> Self {
        SpiceError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SpiceError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SpiceError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SpiceError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        SpiceError::ChannelClosed
    }
}

impl From<rustls::Error> for SpiceError {
    fn from(e: rustls::Error) -> Self {
        SpiceError::Tls(e.to_string())
    }
}

impl From<rsa::Error> for SpiceError {
    fn from(e: rsa::Error) -> Self {
        SpiceError::Auth(e.to_string())
    }
}
