//! Error types for strand-transport.

use std::io;

/// Result type for bind and configuration operations.
pub type Result<T, E = BindError> = std::result::Result<T, E>;

/// Why a connection's byte pipeline stopped.
///
/// The first reason recorded under the shutdown lock wins and is reflected
/// into both pipe completions, which is why this type is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The peer closed the connection abruptly.
    #[error("connection reset by peer")]
    Reset,

    /// The connection was torn down locally.
    #[error("connection aborted: {0}")]
    Aborted(String),

    /// Synthetic cause recorded when the send loop finishes without error.
    #[error("the transport send loop completed gracefully")]
    SendLoopCompleted,

    /// Transport failure that was neither a reset nor a local abort.
    #[error("transport error: {message}")]
    Unexpected {
        kind: io::ErrorKind,
        message: String,
    },
}

impl ConnectionError {
    /// Builds the unexpected variant from an io error, keeping its kind.
    pub fn unexpected(error: &io::Error) -> Self {
        Self::Unexpected {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Errors raised while binding an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// No factory in the registry claimed the endpoint.
    #[error("no registered factory supports endpoint {kind}: {endpoint}")]
    NoFactory {
        kind: &'static str,
        endpoint: String,
    },

    /// The registry has no factories of the required shape at all.
    #[error("no {kind} listener factories are registered")]
    NoFactories { kind: &'static str },

    /// The selected factory cannot bind this endpoint shape.
    #[error("endpoint {0} is not supported by this transport")]
    UnsupportedEndpoint(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
