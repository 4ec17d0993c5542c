//! Unary, server streaming, client streaming and bidi streaming rpc over a
//! single multiplexed connection.
//!
//! # Overview
//!
//! A [`Connection`] is one logical link to a peer. Every call opens a new
//! *exchange* on it: an independent pair of ordered item sequences, one in
//! each direction. The four interaction patterns differ only in how many
//! items flow each way:
//!
//! - [unary](Connection::unary): 1 request, 1 response
//! - [server streaming](Connection::server_streaming): 1 request, stream of responses
//! - [client streaming](Connection::client_streaming): stream of requests, 1 response
//! - [bidi streaming](Connection::bidi_streaming): stream of requests, stream of responses
//!
//! On the serving side a [`Router`] holds one handler per route and an
//! [`RpcServer`] drives inbound exchanges to them.
//!
//! # Example
//! ```
//! # async fn example() -> anyhow::Result<()> {
//! use pattern_rpc::{transport::flume, Connection, Router, RpcServer, Service};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Ping(u64);
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Pong(u64);
//!
//! #[derive(Debug, Clone)]
//! struct PingService;
//!
//! impl Service for PingService {
//!     type Req = Ping;
//!     type Res = Pong;
//! }
//!
//! let router = Router::<PingService>::new().unary("ping", |Ping(n)| async move { Ok(Pong(n)) });
//! let (listener, connector) = flume::channel(1);
//! let server = RpcServer::new(listener, router);
//! tokio::spawn(server.run());
//!
//! let conn = Connection::<PingService, _>::new(connector);
//! let Pong(n) = conn.unary("ping", Ping(7)).await?;
//! assert_eq!(n, 7);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt::Debug,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub mod client;
pub mod error;
pub mod exchange;
pub mod greeter;
pub mod message;
pub mod pattern;
pub mod server;
pub mod transport;

pub use client::{ConnectOptions, Connection, ConnectionState, Security};
pub use error::{Code, ConnectError, RpcError};
pub use exchange::{ExchangeStatus, RequestSink, ResponseFuture, ResponseStream};
pub use message::Pattern;
pub use server::{RequestStream, Router, RpcServer, ShutdownHandle};
#[doc(inline)]
pub use transport::{Connector, Listener};

/// Requirements for a RPC message
///
/// Even when just using the mem transport, we require messages to be Serializable and Deserializable.
/// Likewise, even when using the tcp transport, we require messages to be Send.
pub trait RpcMessage: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcMessage for T where
    T: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
}

/// Requirements for a transport error
///
/// All errors have to be Send and 'static so they can be sent across threads.
pub trait TransportError: Debug + std::fmt::Display + Send + Sync + Unpin + 'static {}

impl<T> TransportError for T where T: Debug + std::fmt::Display + Send + Sync + Unpin + 'static {}

/// A service
///
/// The service only fixes the item types. Which routes exist and which
/// interaction pattern each of them uses is decided by the [`Router`] on the
/// serving side.
pub trait Service: Send + Sync + Debug + Clone + 'static {
    /// Type of request items
    type Req: RpcMessage;
    /// Type of response items
    type Res: RpcMessage;
}

/// Lock a mutex, ignoring poisoning. None of the guarded state can be left
/// half updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
