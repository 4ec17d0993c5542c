//! Built in transports
//!
//! There are two sides to a transport, a server side where exchanges are
//! accepted and a client side where exchanges are initiated.
//!
//! Every exchange is a bidirectional typed channel, with a distinct type for
//! the send and receive side. Transports know nothing about services, routes
//! or interaction patterns; they only move already-decoded items.
//!
//! In the transport module, the message types are referred to as `In` and `Out`.
//!
//! A [`Connector`] can be used to *open* exchanges using [`Connector::open`].
//! A [`Listener`] can be used to *accept* exchanges from any of the currently
//! connected clients, using [`Listener::accept`].
//!
//! In both cases, the result is a tuple of a send side and a receive side. These
//! types are defined by implementing the [`StreamTypes`] trait. Dropping the
//! send side closes that direction; the other end sees the receive side end.
//!
//! Errors for both sides are defined by implementing the [`ConnectionErrors`] trait.
use std::{
    fmt::{self, Debug, Display},
    net::SocketAddr,
};

use futures_lite::{Future, Stream};
use futures_sink::Sink;

use crate::{
    message::{Request, Response},
    RpcMessage, Service, TransportError,
};

#[cfg(feature = "flume-transport")]
pub mod flume;
#[cfg(feature = "tcp-transport")]
pub mod tcp;

/// Errors that can happen when creating and using a [`Connector`] or [`Listener`].
pub trait ConnectionErrors: Debug + Clone + Send + Sync + 'static {
    /// Error when sending a message via a channel
    type SendError: TransportError;
    /// Error when receiving a message via a channel
    type RecvError: TransportError;
    /// Error when opening a channel
    type OpenError: TransportError;
    /// Error when accepting a channel
    type AcceptError: TransportError;
}

/// Types that are common to both [`Connector`] and [`Listener`].
///
/// Having this as a separate trait is useful when writing generic code that works with both.
pub trait StreamTypes: ConnectionErrors {
    /// The type of messages that can be received on the channel
    type In: RpcMessage;
    /// The type of messages that can be sent on the channel
    type Out: RpcMessage;
    /// Receive side of a bidirectional typed channel
    type RecvStream: Stream<Item = Result<Self::In, Self::RecvError>>
        + Send
        + Sync
        + Unpin
        + 'static;
    /// Send side of a bidirectional typed channel
    type SendSink: Sink<Self::Out, Error = Self::SendError> + Send + Sync + Unpin + 'static;
}

/// A connection to a specific remote machine
///
/// A connector can be used to open bidirectional typed channels using [`Connector::open`].
pub trait Connector: StreamTypes {
    /// Open a channel to the remote
    fn open(
        &self,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::OpenError>> + Send;

    /// Tear down transport level state.
    ///
    /// Called once by the owning [`Connection`](crate::Connection) when it is
    /// closed. Channels that are still open afterwards see their streams end.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// A listener that listens for exchanges
///
/// A listener can be used to accept bidirectional typed channels from any of the
/// currently connected clients, using [`Listener::accept`].
pub trait Listener: StreamTypes {
    /// Accept a new typed bidirectional channel on any of the connections we
    /// have currently opened.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::AcceptError>> + Send;

    /// The local addresses this listener is bound to.
    fn local_addr(&self) -> &[LocalAddr];
}

/// A [`Connector`] that speaks the envelopes of service `S`.
///
/// This is just a trait alias for a [`Connector`] with the right types.
pub trait ServiceConnector<S: Service>:
    Connector<In = Response<S::Res>, Out = Request<S::Req>>
{
}

impl<T, S> ServiceConnector<S> for T
where
    T: Connector<In = Response<S::Res>, Out = Request<S::Req>>,
    S: Service,
{
}

/// A [`Listener`] that speaks the envelopes of service `S`.
///
/// This is just a trait alias for a [`Listener`] with the right types.
pub trait ServiceListener<S: Service>:
    Listener<In = Request<S::Req>, Out = Response<S::Res>>
{
}

impl<T, S> ServiceListener<S> for T
where
    T: Listener<In = Request<S::Req>, Out = Response<S::Res>>,
    S: Service,
{
}

/// The kinds of local addresses a [Listener] can be bound to.
///
/// Returned by [Listener::local_addr].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum LocalAddr {
    /// A local socket.
    Socket(SocketAddr),
    /// An in-memory address.
    Mem,
}

impl Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalAddr::Socket(sockaddr) => write!(f, "{sockaddr}"),
            LocalAddr::Mem => write!(f, "mem"),
        }
    }
}
