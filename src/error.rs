//! Error types shared by the caller and the handler side.
use std::{fmt, io};

use serde::{Deserialize, Serialize};

/// Status code of a failed exchange.
///
/// Mirrors the usual rpc status semantics. `Aborted` is used when an exchange
/// is force-released because a connection or server shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The exchange was cancelled, typically by the caller.
    Cancelled,
    /// The request was malformed for the route it was sent to.
    InvalidArgument,
    /// The per-call deadline elapsed.
    DeadlineExceeded,
    /// The exchange was abandoned by a shutdown with an expired grace period.
    Aborted,
    /// No handler is registered for the route.
    Unimplemented,
    /// The handler failed, panicked or broke the protocol.
    Internal,
    /// The transport went away.
    Unavailable,
}

impl Code {
    /// Name of the code as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Cancelled => "Cancelled",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::Aborted => "Aborted",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error of a single exchange.
///
/// This is what callers see for every failed call, and what handlers return
/// to fail a call. It travels over the wire, so it is serializable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    /// Status code
    pub code: Code,
    /// Human readable detail
    pub message: String,
}

impl RpcError {
    /// Create a new error from a code and a message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// [`Code::Cancelled`]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// [`Code::InvalidArgument`]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// [`Code::DeadlineExceeded`]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// [`Code::Unimplemented`]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// [`Code::Internal`]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// [`Code::Unavailable`]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// The exchange was force-released by a shutdown whose grace period expired.
    pub fn aborted_on_shutdown() -> Self {
        Self::new(Code::Aborted, "aborted on shutdown")
    }

    /// True if this is the error produced by [`RpcError::aborted_on_shutdown`].
    ///
    /// Other [`Code::Aborted`] errors, e.g. ones returned by a handler, are
    /// not shutdown aborts.
    pub fn is_aborted_on_shutdown(&self) -> bool {
        *self == Self::aborted_on_shutdown()
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::internal(format!("{e:#}"))
    }
}

/// Error when opening a [`Connection`](crate::Connection).
///
/// Fatal to the connection attempt. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The peer could not be reached
    #[error("peer unreachable: {0}")]
    Unreachable(#[from] io::Error),
    /// Connecting took longer than the configured timeout
    #[error("connect timed out")]
    Timeout,
    /// The options can not be honored
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shutdown_aborts_count_as_such() {
        assert!(RpcError::aborted_on_shutdown().is_aborted_on_shutdown());
        let handler_abort = RpcError::new(Code::Aborted, "transaction conflict");
        assert!(!handler_abort.is_aborted_on_shutdown());
        assert!(!RpcError::cancelled("aborted on shutdown").is_aborted_on_shutdown());
    }
}
