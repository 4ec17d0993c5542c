//! Client side api
//!
//! The main entry point is [Connection]. The pattern drivers
//! ([unary](Connection::unary), [server_streaming](Connection::server_streaming),
//! [client_streaming](Connection::client_streaming) and
//! [bidi_streaming](Connection::bidi_streaming)) are implemented in the
//! [pattern](crate::pattern) modules.
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_lite::StreamExt;
use futures_util::SinkExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{
    exchange::{BoxRecvStream, BoxSendSink, ExchangeContext, Registry},
    lock,
    message::{Pattern, Request},
    transport::ServiceConnector,
    RpcError, Service,
};

/// Lifecycle state of a [Connection]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is being established
    Connecting,
    /// Exchanges can be opened
    Ready,
    /// Closing: no new exchanges, outstanding ones may still finish
    Draining,
    /// Closed for good
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport security for [Connection::open]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Security {
    /// Plain text, no encryption
    #[default]
    Plaintext,
    /// TLS. Not supported by the built in transports.
    Tls,
}

/// Options for [Connection::open]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Transport security
    pub security: Security,
    /// Give up dialing after this long
    pub connect_timeout: Option<Duration>,
    /// Every exchange opened on the connection fails with
    /// [`DeadlineExceeded`](crate::Code::DeadlineExceeded) if it is still
    /// running after this long
    pub call_timeout: Option<Duration>,
    /// Runtime that runs the transport tasks of the connection.
    ///
    /// Defaults to the runtime `open` is called on.
    pub runtime: Option<tokio::runtime::Handle>,
    /// Maximum size of a single encoded frame
    pub max_frame_length: usize,
    /// Number of items a peer may send on one exchange before it has to wait
    /// for the receiver to catch up
    pub window: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            security: Security::Plaintext,
            connect_timeout: Some(Duration::from_secs(10)),
            call_timeout: None,
            runtime: None,
            max_frame_length: 1024 * 1024 * 16,
            window: 32,
        }
    }
}

/// A connection for a specific service
///
/// This is a wrapper around a [`ServiceConnector`] that serves as the entry
/// point for the client DSL. It is cheap to clone; all clones share the same
/// underlying transport and lifecycle.
///
/// Type parameters:
///
/// `S` is the service type that determines the request and response items.
/// `C` is the connector that determines the transport.
pub struct Connection<S, C> {
    pub(crate) inner: Arc<Inner<C>>,
    pub(crate) _p: PhantomData<S>,
}

pub(crate) struct Inner<C> {
    source: C,
    state: AtomicU8,
    next_id: AtomicU64,
    /// Tracks every exchange that was opened and is not finished yet
    exchanges: TaskTracker,
    /// Parent of the abort token of every exchange
    abort: CancellationToken,
    /// Exchanges whose transport halves are still alive
    registry: Arc<Registry>,
    /// Cancelled once [Connection::close] is done
    closed: CancellationToken,
    call_timeout: Option<Duration>,
}

impl<S, C> Clone for Connection<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _p: PhantomData,
        }
    }
}

impl<S, C: Debug> Debug for Connection<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("source", &self.inner.source)
            .field(
                "state",
                &ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst)),
            )
            .field("exchanges", &self.inner.exchanges.len())
            .finish()
    }
}

impl<S, C> Connection<S, C>
where
    S: Service,
    C: ServiceConnector<S>,
{
    /// Create a new connection for a specific [Service] given a compatible,
    /// already established [`ServiceConnector`].
    ///
    /// The connection is [Ready](ConnectionState::Ready) right away.
    pub fn new(source: C) -> Self {
        Self::with_call_timeout(source, None)
    }

    /// Like [Connection::new], but every exchange fails with
    /// [`DeadlineExceeded`](crate::Code::DeadlineExceeded) when it takes
    /// longer than `call_timeout`.
    pub fn with_call_timeout(source: C, call_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                state: AtomicU8::new(ConnectionState::Ready as u8),
                next_id: AtomicU64::new(0),
                exchanges: TaskTracker::new(),
                abort: CancellationToken::new(),
                registry: Default::default(),
                closed: CancellationToken::new(),
                call_timeout,
            }),
            _p: PhantomData,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Number of exchanges that are opened and not finished yet
    pub fn active_exchanges(&self) -> usize {
        self.inner.exchanges.len()
    }

    /// Get the underlying connector
    pub fn as_connector(&self) -> &C {
        &self.inner.source
    }

    /// Close the connection.
    ///
    /// No new exchanges can be opened from the moment this is called.
    /// Outstanding exchanges get up to `grace_period` to finish. Exchanges
    /// still running after that are failed with
    /// [`Aborted`](crate::Code::Aborted) and the transport is torn down.
    ///
    /// Only the first call closes the connection and returns `true`. Any
    /// other call waits until the connection is closed and returns `false`.
    pub async fn close(&self, grace_period: Duration) -> bool {
        let drained = self.inner.state.compare_exchange(
            ConnectionState::Ready as u8,
            ConnectionState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if drained.is_err() {
            self.inner.closed.cancelled().await;
            return false;
        }
        let exchanges = &self.inner.exchanges;
        exchanges.close();
        debug!(pending = exchanges.len(), ?grace_period, "draining connection");
        if tokio::time::timeout(grace_period, exchanges.wait())
            .await
            .is_err()
        {
            warn!(
                pending = exchanges.len(),
                "grace period elapsed, aborting pending exchanges"
            );
        }
        self.inner.abort.cancel();
        // exchanges nobody polls anymore would otherwise hold on to the transport
        let pending = std::mem::take(&mut *lock(&self.inner.registry));
        for exchange in pending.into_values().filter_map(|e| e.upgrade()) {
            exchange.release();
        }
        self.inner.source.close().await;
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.inner.closed.cancel();
        debug!("connection closed");
        true
    }

    /// Open a new exchange and send its `Open` envelope.
    pub(crate) async fn open_exchange(
        &self,
        route: &str,
        pattern: Pattern,
    ) -> Result<(ExchangeContext, BoxSendSink<S::Req>, BoxRecvStream<S::Res>), RpcError> {
        let inner = &self.inner;
        // taken before the state check, so a concurrent close waits for us
        let token = inner.exchanges.token();
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(RpcError::unavailable(format!("connection is {state}")));
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ExchangeContext::new(
            id,
            token,
            inner.registry.clone(),
            inner.abort.child_token(),
            inner.call_timeout,
        );
        let (send, recv) = inner
            .source
            .open()
            .await
            .map_err(|e| RpcError::unavailable(format!("unable to open exchange: {e}")))?;
        let mut send: BoxSendSink<S::Req> = Box::pin(
            send.sink_map_err(|e| RpcError::unavailable(format!("send failed: {e}"))),
        );
        let recv: BoxRecvStream<S::Res> = Box::pin(
            recv.map(|item| item.map_err(|e| RpcError::unavailable(format!("recv failed: {e}")))),
        );
        send.send(Request::Open {
            route: route.to_string(),
            pattern,
        })
        .await?;
        debug!(id, route, %pattern, "opened exchange");
        Ok((ctx, send, recv))
    }
}

#[cfg(feature = "tcp-transport")]
mod tcp {
    use tokio::net::ToSocketAddrs;
    use tracing::debug;

    use super::{ConnectOptions, Connection, ConnectionState, Security};
    use crate::{
        message::{Request, Response},
        transport::tcp::{TcpConfig, TcpConnector},
        ConnectError, Service,
    };

    /// A tcp connector for the given [`Service`]
    pub type TcpServiceConnector<S> =
        TcpConnector<Response<<S as Service>::Res>, Request<<S as Service>::Req>>;

    impl<S: Service> Connection<S, TcpServiceConnector<S>> {
        /// Dial `addr` and return a [Ready](ConnectionState::Ready) connection.
        ///
        /// All exchanges opened on the connection are multiplexed over a
        /// single tcp stream whose tasks run on `options.runtime`.
        pub async fn open(
            addr: impl ToSocketAddrs + std::fmt::Debug,
            options: ConnectOptions,
        ) -> Result<Self, ConnectError> {
            if options.security != Security::Plaintext {
                return Err(ConnectError::InvalidOptions(
                    "the tcp transport only supports plaintext".into(),
                ));
            }
            if options.window == 0 {
                return Err(ConnectError::InvalidOptions(
                    "window must be at least 1".into(),
                ));
            }
            debug!(?addr, state = %ConnectionState::Connecting, "dialing");
            let config = TcpConfig {
                max_frame_length: options.max_frame_length,
                window: options.window,
                runtime: options.runtime.clone(),
            };
            let connecting = TcpConnector::connect(addr, config);
            let connector = match options.connect_timeout {
                Some(timeout) => tokio::time::timeout(timeout, connecting)
                    .await
                    .map_err(|_| ConnectError::Timeout)??,
                None => connecting.await?,
            };
            Ok(Self::with_call_timeout(connector, options.call_timeout))
        }
    }
}

#[cfg(feature = "tcp-transport")]
pub use tcp::TcpServiceConnector;
