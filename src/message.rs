//! Interaction patterns and the envelopes that carry items of an exchange.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RpcError;

/// Interaction pattern of an exchange.
///
/// Currently there are 4 patterns:
/// - [Pattern::Unary]: 1 request, 1 response
/// - [Pattern::ServerStreaming]: 1 request, stream of responses
/// - [Pattern::ClientStreaming]: stream of requests, 1 response
/// - [Pattern::BidiStreaming]: stream of requests, stream of responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    /// Exactly one request, exactly one response
    Unary,
    /// One request, a stream of responses
    ServerStreaming,
    /// A stream of requests, one response once the requests are finished
    ClientStreaming,
    /// Independent request and response streams
    BidiStreaming,
}

impl Pattern {
    /// True if the caller sends exactly one request item
    pub fn single_request(&self) -> bool {
        matches!(self, Pattern::Unary | Pattern::ServerStreaming)
    }

    /// True if the handler sends exactly one response item
    pub fn single_response(&self) -> bool {
        matches!(self, Pattern::Unary | Pattern::ClientStreaming)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Envelope for everything the caller sends on an exchange.
///
/// `Open` is always the first message. `Finish` is the explicit end of the
/// request sequence, which is different from the underlying channel closing:
/// a channel that closes without `Finish` means the caller went away.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request<T> {
    /// Start of an exchange
    Open {
        /// Opaque route identifier
        route: String,
        /// Interaction pattern the caller is going to use
        pattern: Pattern,
    },
    /// A request item
    Item(T),
    /// No more request items will follow
    Finish,
}

/// Envelope for everything the handler sends on an exchange.
///
/// `Status` is always the last message. A channel that closes without a
/// status means the exchange was torn down underneath the caller.
#[derive(Debug, Serialize, Deserialize)]
pub enum Response<T> {
    /// A response item
    Item(T),
    /// Terminal status of the exchange
    Status(Result<(), RpcError>),
}
