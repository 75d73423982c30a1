//! Client error types.

use tds_codec::CodecError;
use tds_protocol::{ProtocolError, ServerMessage};
use tds_tls::TlsError;
use tds_types::TypeError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed, or was closed while the request was queued.
    #[error("connection closed")]
    ConnectionClosed,

    /// A message was sent in a connection state that does not allow it.
    ///
    /// Never retryable on the same connection.
    #[error("protocol sequencing error: {0}")]
    Sequencing(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Type conversion error.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: i32,
    },

    /// The server rejected the login.
    #[error("login failed ({number}): {message}")]
    Login {
        /// Error number.
        number: i32,
        /// Server message.
        message: String,
    },

    /// The client requires encryption but the server cannot provide it.
    #[error("encryption required but not supported by the server")]
    EncryptionNotSupported,

    /// Inserting or removing a pipeline stage failed.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// No column with this name in the row.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// Connection timeout occurred.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient and may succeed on a new connection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout | Self::ConnectionClosed | Self::Io(_)
        )
    }

    /// Check if this error indicates a malformed byte stream.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Codec(_))
    }

    /// Check if this error is a wrong-state send.
    #[must_use]
    pub fn is_sequencing_error(&self) -> bool {
        matches!(self, Self::Sequencing(_))
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Get the error class/severity if this is a server error.
    ///
    /// SQL Server error classes range from 0-25:
    /// - 0-10: Informational
    /// - 11-16: User errors
    /// - 17-19: Resource/hardware errors
    /// - 20-25: System errors (connection terminating)
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }

    pub(crate) fn sequencing(message: impl Into<String>) -> Self {
        Self::Sequencing(message.into())
    }
}

impl From<ServerMessage> for Error {
    fn from(msg: ServerMessage) -> Self {
        fn non_empty(s: String) -> Option<String> {
            (!s.is_empty()).then_some(s)
        }

        Self::Server {
            number: msg.number,
            class: msg.class,
            state: msg.state,
            message: msg.message,
            server: non_empty(msg.server),
            procedure: non_empty(msg.procedure),
            line: msg.line,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
