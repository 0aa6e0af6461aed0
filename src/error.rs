//! Error types for the RPC engine.
//!
//! Errors fall into three families:
//!
//! - **Exceptions** (`Failed`, `Overloaded`, `Disconnected`, `Unimplemented`)
//!   travel on the wire inside `Return` and `Abort` messages and never fail a
//!   connection by themselves.
//! - **Protocol violations** mean the peer broke a table invariant. They are
//!   fatal and the connection sends a best-effort `Abort` before closing.
//! - **Transport failures** are fatal as well, but no `Abort` is attempted.
//!
//! [`ErrorKind::IdExhausted`] is kept separate from protocol violations so
//! that table exhaustion can be asserted in tests without tearing down the
//! process.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Exception type carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ExceptionType {
    /// Generic failure.
    Failed = 0,
    /// The callee is temporarily out of resources.
    Overloaded = 1,
    /// The capability or connection is gone.
    Disconnected = 2,
    /// The callee does not implement the requested method or message.
    Unimplemented = 3,
}

impl ExceptionType {
    /// Converts a wire code into an exception type.
    ///
    /// Unknown codes degrade to [`ExceptionType::Failed`].
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::Overloaded,
            2 => Self::Disconnected,
            3 => Self::Unimplemented,
            _ => Self::Failed,
        }
    }

    /// Returns the wire code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns a lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Overloaded => "overloaded",
            Self::Disconnected => "disconnected",
            Self::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic failure (application or engine).
    Failed,
    /// Temporary resource exhaustion at the callee.
    Overloaded,
    /// Peer or connection unavailable.
    Disconnected,
    /// Method or message not implemented.
    Unimplemented,
    /// The peer violated the protocol. Fatal to the connection.
    Protocol,
    /// The transport failed. Fatal to the connection, no abort is sent.
    Transport,
    /// A 32-bit id table ran out of ids. Fatal to the connection.
    IdExhausted,
}

impl ErrorKind {
    /// Maps this kind onto the exception type sent to a peer.
    #[must_use]
    pub const fn exception_type(self) -> ExceptionType {
        match self {
            Self::Overloaded => ExceptionType::Overloaded,
            Self::Disconnected | Self::Transport => ExceptionType::Disconnected,
            Self::Unimplemented => ExceptionType::Unimplemented,
            Self::Failed | Self::Protocol | Self::IdExhausted => ExceptionType::Failed,
        }
    }

    /// Returns true if an error of this kind must shut the connection down.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Protocol | Self::Transport | Self::IdExhausted)
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Overloaded => "overloaded",
            Self::Disconnected => "disconnected",
            Self::Unimplemented => "unimplemented",
            Self::Protocol => "protocol violation",
            Self::Transport => "transport error",
            Self::IdExhausted => "id space exhausted",
        }
    }
}

impl From<ExceptionType> for ErrorKind {
    fn from(ty: ExceptionType) -> Self {
        match ty {
            ExceptionType::Failed => Self::Failed,
            ExceptionType::Overloaded => Self::Overloaded,
            ExceptionType::Disconnected => Self::Disconnected,
            ExceptionType::Unimplemented => Self::Unimplemented,
        }
    }
}

/// An engine error.
///
/// # Example
///
/// ```
/// use vatlink::{Error, ErrorKind};
///
/// let err = Error::protocol("unknown export ID 7").with_context("incoming call");
/// assert_eq!(err.kind(), ErrorKind::Protocol);
/// assert!(err.is_fatal());
/// assert_eq!(err.to_string(), "incoming call: unknown export ID 7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    context: Option<String>,
}

impl Error {
    /// Creates a new error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    /// Creates an overloaded error.
    #[must_use]
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    /// Creates a disconnected error.
    #[must_use]
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    /// Creates an unimplemented error.
    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }

    /// Creates a protocol violation.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Creates an id-exhaustion error for the named table.
    #[must_use]
    pub fn id_exhausted(table: &str) -> Self {
        Self::new(ErrorKind::IdExhausted, format!("{table} IDs exhausted"))
    }

    /// The error returned for anything attempted on a closed connection.
    #[must_use]
    pub fn connection_closed() -> Self {
        Self::disconnected("connection closed")
    }

    /// Rebuilds an error from a wire exception.
    #[must_use]
    pub fn from_exception(ty: ExceptionType, reason: impl Into<String>) -> Self {
        Self::new(ty.into(), reason)
    }

    /// Returns the kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message without context.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Prefixes the message with context. Nested calls stack outermost first.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        self.context = Some(match self.context.take() {
            Some(inner) => format!("{ctx}: {inner}"),
            None => ctx,
        });
        self
    }

    /// Returns true if this error must shut the connection down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Returns true for protocol violations.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol)
    }

    /// Returns true for transport failures.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport)
    }

    /// Returns true for disconnection.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::Disconnected)
    }

    /// Returns the exception type this error is sent as.
    #[must_use]
    pub const fn exception_type(&self) -> ExceptionType {
        self.kind.exception_type()
    }

    /// Short label for the kind, used in logs.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        self.kind.label()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{ctx}: ")?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for Error {}

/// Result type for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures surfaced by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed locally or by the peer.
    #[error("transport closed")]
    Closed,
    /// Underlying I/O failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A message body could not be encoded.
    #[error("encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// A message body could not be decoded.
    #[error("decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A frame header announced more bytes than allowed.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A frame was too short to hold a header.
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),
}

impl TransportError {
    /// Returns true if the transport reported an orderly close.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true if the peer sent bytes that do not form a valid message.
    ///
    /// The byte stream itself is still usable, so the connection can send an
    /// `Abort` before it closes.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::FrameTooLarge { .. } | Self::Truncated(_)
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::transport(err.to_string())
    }
}
