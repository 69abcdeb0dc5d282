//! Crate-wide error type.

use std::fmt;
use std::time::Duration;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::registry::ManagementError;
use crate::transport::TransportError;

/// Errors surfaced by connectors, invokers and relays.
#[derive(Debug)]
pub enum Error {
    /// The message-queue transport failed
    Transport(TransportError),
    /// An envelope could not be encoded or decoded
    Codec(CodecError),
    /// The remote (or local) resource registry rejected the call
    Management(ManagementError),
    /// The request could not be delivered to the remote side
    RemoteInvocation(String),
    /// The reply was not a well-formed result envelope
    Protocol(String),
    /// No reply arrived within the receive timeout
    Timeout(Duration),
    /// `connect()` was called on a closed connector
    AlreadyClosed,
    /// `start()` was called on a stopped connector
    AlreadyStopped,
    /// The connector has not been connected yet
    NotConnected,
    /// The operation is intentionally not provided
    Unsupported(&'static str),
    /// Invalid configuration or connection URL
    Config(ConfigError),
    /// Waiting for a connection was aborted by shutdown
    Interrupted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::Management(e) => write!(f, "{}", e),
            Self::RemoteInvocation(msg) => write!(f, "remote invocation failed: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Timeout(after) => write!(f, "no reply received within {:?}", after),
            Self::AlreadyClosed => write!(f, "connect() impossible after close"),
            Self::AlreadyStopped => write!(f, "start() after close() is not valid"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            Self::Config(e) => write!(f, "{}", e),
            Self::Interrupted => write!(f, "interrupted while waiting for a connection"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Management(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<ManagementError> for Error {
    fn from(err: ManagementError) -> Self {
        Self::Management(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl Error {
    /// The remote-side failure, if this error carries one.
    pub fn as_management(&self) -> Option<&ManagementError> {
        match self {
            Self::Management(e) => Some(e),
            _ => None,
        }
    }

    /// Converts into a failure that can travel back over the wire.
    pub fn into_management(self) -> ManagementError {
        match self {
            Self::Management(e) => e,
            other => ManagementError::Internal(other.to_string()),
        }
    }
}

/// Result type for mqmx operations.
pub type Result<T> = std::result::Result<T, Error>;
