//! Server side api
//!
//! Handlers are registered per route on a [Router]. An [RpcServer] accepts
//! exchanges from a [`Listener`](crate::Listener), dispatches them by route
//! and runs every handler invocation on its own task.
use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::{future::Boxed as BoxFuture, stream::Boxed as BoxStream, Future, Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{FutureExt, SinkExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::{
    message::{Pattern, Request, Response},
    pattern::{bidi_streaming, client_streaming, server_streaming, unary},
    transport::{LocalAddr, ServiceListener},
    RpcError, Service,
};

/// Default time in flight exchanges get to finish when a server shuts down
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Number of request items buffered for a handler that is not reading
const REQUEST_BUFFER: usize = 16;

/// How long aborted exchanges get to report their status
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed send half of an inbound exchange, errors already mapped to [`RpcError`]
pub(crate) type ResponseSink<T> = Pin<Box<dyn Sink<Response<T>, Error = RpcError> + Send + 'static>>;

/// Boxed receive half of an inbound exchange, errors already mapped to [`RpcError`]
pub(crate) type RequestSource<T> =
    Pin<Box<dyn Stream<Item = Result<Request<T>, RpcError>> + Send + 'static>>;

pub(crate) type UnaryFn<S> =
    Box<dyn Fn(<S as Service>::Req) -> BoxFuture<Result<<S as Service>::Res, RpcError>> + Send + Sync>;
pub(crate) type ServerStreamingFn<S> =
    Box<dyn Fn(<S as Service>::Req) -> BoxStream<Result<<S as Service>::Res, RpcError>> + Send + Sync>;
pub(crate) type ClientStreamingFn<S> = Box<
    dyn Fn(RequestStream<<S as Service>::Req>) -> BoxFuture<Result<<S as Service>::Res, RpcError>>
        + Send
        + Sync,
>;
pub(crate) type BidiStreamingFn<S> = Box<
    dyn Fn(RequestStream<<S as Service>::Req>) -> BoxStream<Result<<S as Service>::Res, RpcError>>
        + Send
        + Sync,
>;

/// The handler registered for a route, one slot per interaction pattern
pub(crate) enum Handler<S: Service> {
    Unary(UnaryFn<S>),
    ServerStreaming(ServerStreamingFn<S>),
    ClientStreaming(ClientStreamingFn<S>),
    BidiStreaming(BidiStreamingFn<S>),
}

impl<S: Service> Handler<S> {
    fn pattern(&self) -> Pattern {
        match self {
            Handler::Unary(_) => Pattern::Unary,
            Handler::ServerStreaming(_) => Pattern::ServerStreaming,
            Handler::ClientStreaming(_) => Pattern::ClientStreaming,
            Handler::BidiStreaming(_) => Pattern::BidiStreaming,
        }
    }
}

/// Routes of a service and the handler for each of them.
///
/// Every route has exactly one handler of one interaction pattern. Registering
/// a route again replaces the previous handler.
///
/// Handlers fail a call by returning an [`RpcError`]. A handler that panics
/// fails the call with [`Internal`](crate::Code::Internal); the server keeps
/// running.
pub struct Router<S: Service> {
    routes: HashMap<String, Handler<S>>,
}

impl<S: Service> Default for Router<S> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<S: Service> Debug for Router<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.routes()).finish()
    }
}

impl<S: Service> Router<S> {
    /// Create a router without any routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler: one request, one response
    pub fn unary<F, Fut>(self, route: impl Into<String>, f: F) -> Self
    where
        F: Fn(S::Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S::Res, RpcError>> + Send + 'static,
    {
        self.insert(route.into(), Handler::Unary(Box::new(move |req| f(req).boxed())))
    }

    /// Register a server streaming handler: one request, a stream of responses
    ///
    /// The call completes successfully when the stream ends. Yielding an error
    /// fails the call; responses yielded before stay delivered.
    pub fn server_streaming<F, Str>(self, route: impl Into<String>, f: F) -> Self
    where
        F: Fn(S::Req) -> Str + Send + Sync + 'static,
        Str: Stream<Item = Result<S::Res, RpcError>> + Send + 'static,
    {
        self.insert(
            route.into(),
            Handler::ServerStreaming(Box::new(move |req| f(req).boxed())),
        )
    }

    /// Register a client streaming handler: a stream of requests, one response
    pub fn client_streaming<F, Fut>(self, route: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestStream<S::Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S::Res, RpcError>> + Send + 'static,
    {
        self.insert(
            route.into(),
            Handler::ClientStreaming(Box::new(move |requests| f(requests).boxed())),
        )
    }

    /// Register a bidi streaming handler: independent streams of requests and
    /// responses
    ///
    /// The call completes when the response stream ends, no matter whether
    /// the caller is still sending.
    pub fn bidi_streaming<F, Str>(self, route: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestStream<S::Req>) -> Str + Send + Sync + 'static,
        Str: Stream<Item = Result<S::Res, RpcError>> + Send + 'static,
    {
        self.insert(
            route.into(),
            Handler::BidiStreaming(Box::new(move |requests| f(requests).boxed())),
        )
    }

    /// The registered routes and their interaction patterns
    pub fn routes(&self) -> impl Iterator<Item = (&str, Pattern)> {
        self.routes
            .iter()
            .map(|(route, handler)| (route.as_str(), handler.pattern()))
    }

    fn insert(mut self, route: String, handler: Handler<S>) -> Self {
        let pattern = handler.pattern();
        if let Some(previous) = self.routes.insert(route.clone(), handler) {
            warn!(%route, previous = %previous.pattern(), %pattern, "replacing handler");
        }
        self
    }
}

/// Lazy sequence of the request items of a client streaming or bidi streaming
/// call.
///
/// Ends when the caller signals the end of its requests. If the caller goes
/// away instead, the whole handler invocation is stopped.
pub struct RequestStream<T: 'static>(flume::r#async::RecvStream<'static, T>);

impl<T: 'static> RequestStream<T> {
    pub(crate) fn channel() -> (flume::Sender<T>, Self) {
        let (tx, rx) = flume::bounded(REQUEST_BUFFER);
        (tx, Self(rx.into_stream()))
    }
}

impl<T: 'static> Debug for RequestStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream").finish()
    }
}

impl<T: 'static> Stream for RequestStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

/// Read the request direction of an exchange until the call has to end.
///
/// Request items are forwarded to `items` as long as the request direction is
/// open. `None` means the caller already signalled the end of its requests.
/// The returned future only resolves with the error that ends the call: the
/// caller going away, a transport failure or a protocol violation.
///
/// The request direction is read even while the handler is not reading its
/// [RequestStream]. Items it is not ready for are queued here, so a caller
/// going away is noticed at any time.
pub(crate) async fn pump<T: Send + 'static>(
    mut recv: RequestSource<T>,
    mut items: Option<flume::Sender<T>>,
) -> RpcError {
    let mut finished = items.is_none();
    let mut backlog = VecDeque::new();
    let mut sending: Option<Pin<Box<flume::r#async::SendFut<'static, T>>>> = None;
    loop {
        if sending.is_none() {
            if let Some(tx) = &items {
                match backlog.pop_front() {
                    Some(item) => sending = Some(Box::pin(tx.clone().into_send_async(item))),
                    None if finished => {
                        trace!("end of requests");
                        items = None;
                    }
                    None => {}
                }
            }
        }
        let sent = async {
            match sending.as_mut() {
                Some(send) => send.as_mut().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = sent => {
                sending = None;
                if res.is_err() {
                    trace!(dropped = backlog.len() + 1, "handler stopped reading requests");
                    backlog.clear();
                    items = None;
                }
            }
            next = recv.next() => match next {
                Some(Ok(Request::Item(_))) if finished => {
                    return RpcError::invalid_argument("request item after the end of requests")
                }
                Some(Ok(Request::Item(item))) => {
                    if items.is_some() {
                        backlog.push_back(item);
                    }
                }
                Some(Ok(Request::Finish)) if finished => {
                    return RpcError::invalid_argument("duplicate end of requests")
                }
                Some(Ok(Request::Finish)) => finished = true,
                Some(Ok(Request::Open { .. })) => return RpcError::invalid_argument("exchange opened twice"),
                Some(Err(cause)) => return cause,
                None => return RpcError::cancelled("caller went away"),
            },
        }
    }
}

/// Read the request of a single request pattern, including the end of requests.
pub(crate) async fn read_single<T>(recv: &mut RequestSource<T>) -> Result<T, RpcError> {
    let item = match recv.next().await {
        Some(Ok(Request::Item(item))) => item,
        Some(Ok(Request::Finish)) => return Err(RpcError::invalid_argument("missing request item")),
        Some(Ok(Request::Open { .. })) => return Err(RpcError::invalid_argument("exchange opened twice")),
        Some(Err(cause)) => return Err(cause),
        None => return Err(RpcError::cancelled("caller went away")),
    };
    match recv.next().await {
        Some(Ok(Request::Finish)) => Ok(item),
        Some(Ok(_)) => Err(RpcError::invalid_argument("expected exactly one request item")),
        Some(Err(cause)) => Err(cause),
        None => Err(RpcError::cancelled("caller went away")),
    }
}

fn panicked() -> RpcError {
    RpcError::internal("handler panicked")
}

/// Call a handler and run the future it returns, turning panics into errors.
pub(crate) async fn guarded<T>(
    call: impl FnOnce() -> BoxFuture<Result<T, RpcError>>,
) -> Result<T, RpcError> {
    let fut = std::panic::catch_unwind(AssertUnwindSafe(call)).map_err(|_| panicked())?;
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(panicked()))
}

/// Call a handler and drive the stream it returns, turning panics into errors.
///
/// A panic ends the stream after yielding one error.
pub(crate) fn guarded_stream<T: Send + 'static>(
    call: impl FnOnce() -> BoxStream<Result<T, RpcError>>,
) -> BoxStream<Result<T, RpcError>> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(stream) => futures_util::StreamExt::catch_unwind(AssertUnwindSafe(stream))
            .map(|item| item.unwrap_or_else(|_| Err(panicked())))
            .boxed(),
        Err(_) => futures_lite::stream::once(Err(panicked())).boxed(),
    }
}

/// Send every response of `responses`, stopping at the first error.
pub(crate) async fn forward<T>(
    mut responses: BoxStream<Result<T, RpcError>>,
    send: &mut ResponseSink<T>,
) -> Result<(), RpcError> {
    while let Some(response) = responses.next().await {
        send.send(Response::Item(response?)).await?;
    }
    Ok(())
}

pub(crate) async fn race2<T, A: Future<Output = T>, B: Future<Output = T>>(f1: A, f2: B) -> T {
    tokio::select! {
        x = f1 => x,
        x = f2 => x,
    }
}

/// A server for a specific service.
///
/// Serves the routes of a [Router] on the exchanges accepted from a
/// [`ServiceListener`]. Use [RpcServer::shutdown_handle] to stop it.
///
/// Type parameters:
///
/// `S` is the service type.
/// `L` is the listener that determines the transport.
pub struct RpcServer<S: Service, L> {
    listener: L,
    router: Arc<Router<S>>,
    exchanges: TaskTracker,
    shutdown: CancellationToken,
    initiated: Arc<AtomicBool>,
    abort: CancellationToken,
    stopped: CancellationToken,
    grace_period: Duration,
}

impl<S: Service, L: Debug> Debug for RpcServer<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("listener", &self.listener)
            .field("router", &self.router)
            .field("active", &self.exchanges.len())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl<S: Service, L: ServiceListener<S>> RpcServer<S, L> {
    /// Create a new server for the routes of `router`, accepting exchanges
    /// from `listener`.
    pub fn new(listener: L, router: Router<S>) -> Self {
        Self {
            listener,
            router: Arc::new(router),
            exchanges: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            initiated: Arc::new(AtomicBool::new(false)),
            abort: CancellationToken::new(),
            stopped: CancellationToken::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Set how long in flight exchanges get to finish on shutdown.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// A handle to shut the server down from anywhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
            initiated: self.initiated.clone(),
            exchanges: self.exchanges.clone(),
            stopped: self.stopped.clone(),
        }
    }

    /// The local addresses the listener is bound to
    pub fn local_addr(&self) -> &[LocalAddr] {
        self.listener.local_addr()
    }

    /// Number of exchanges that are currently being handled
    pub fn active(&self) -> usize {
        self.exchanges.len()
    }

    /// Serve until shut down or until the listener fails.
    ///
    /// On shutdown the server stops accepting, waits up to the grace period
    /// for in flight exchanges to finish and aborts the rest, whose callers
    /// see [`Aborted`](crate::Code::Aborted). The listener is dropped before
    /// this returns.
    pub async fn run(self) -> Result<(), L::AcceptError> {
        let Self {
            listener,
            router,
            exchanges,
            shutdown,
            abort,
            stopped,
            grace_period,
            ..
        } = self;
        let _stopped = stopped.drop_guard();
        let addrs = listener
            .local_addr()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        debug!(?addrs, routes = router.routes.len(), "serving");
        let res = loop {
            let (send, recv) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(chan) => chan,
                    Err(cause) => {
                        warn!(%cause, "accept failed, stopping server");
                        break Err(cause);
                    }
                },
            };
            let send: ResponseSink<S::Res> =
                Box::pin(send.sink_map_err(|e| RpcError::unavailable(format!("send failed: {e}"))));
            let recv: RequestSource<S::Req> = Box::pin(
                recv.map(|item| item.map_err(|e| RpcError::unavailable(format!("recv failed: {e}")))),
            );
            exchanges.spawn(handle_exchange(router.clone(), send, recv, abort.child_token()));
        };
        exchanges.close();
        info!(pending = exchanges.len(), ?grace_period, "shutting down");
        if tokio::time::timeout(grace_period, exchanges.wait())
            .await
            .is_err()
        {
            warn!(
                pending = exchanges.len(),
                "grace period elapsed, aborting pending exchanges"
            );
            abort.cancel();
            if tokio::time::timeout(ABORT_TIMEOUT, exchanges.wait())
                .await
                .is_err()
            {
                warn!(pending = exchanges.len(), "aborted exchanges did not finish");
            }
        }
        drop(listener);
        info!("server shut down");
        res
    }
}

/// Handle to shut down a running [RpcServer].
///
/// Cheap to clone. All clones control the same server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown: CancellationToken,
    initiated: Arc<AtomicBool>,
    exchanges: TaskTracker,
    stopped: CancellationToken,
}

impl ShutdownHandle {
    /// Start the orderly shutdown of the server.
    ///
    /// Only the first call has an effect. Returns whether this call started
    /// the shutdown.
    pub fn shutdown(&self) -> bool {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    /// True once a shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of exchanges that are currently being handled
    pub fn active(&self) -> usize {
        self.exchanges.len()
    }

    /// Resolves once [RpcServer::run] has returned and the listener is released
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }
}

/// Drive one inbound exchange from `Open` to the terminal status.
async fn handle_exchange<S: Service>(
    router: Arc<Router<S>>,
    mut send: ResponseSink<S::Res>,
    mut recv: RequestSource<S::Req>,
    abort: CancellationToken,
) {
    let (route, pattern) = match recv.next().await {
        Some(Ok(Request::Open { route, pattern })) => (route, pattern),
        Some(Ok(_)) => {
            let status = Err(RpcError::invalid_argument("exchange must start with open"));
            send.send(Response::Status(status)).await.ok();
            return;
        }
        Some(Err(cause)) => {
            debug!(%cause, "unable to read open");
            return;
        }
        None => return,
    };
    let span = debug_span!("exchange", %route, %pattern);
    async move {
        let status = match router.routes.get(&route) {
            None => Err(RpcError::unimplemented(format!("no handler for route {route}"))),
            Some(handler) if handler.pattern() != pattern => Err(RpcError::invalid_argument(format!(
                "route {route} is {}, not {pattern}",
                handler.pattern()
            ))),
            Some(handler) => {
                let aborted = abort.cancelled().map(|_| Err(RpcError::aborted_on_shutdown()));
                race2(aborted, dispatch(handler, &mut send, recv)).await
            }
        };
        match &status {
            Ok(()) => trace!("completed"),
            Err(error) => debug!(%error, "failed"),
        }
        if let Err(cause) = send.send(Response::Status(status)).await {
            trace!(%cause, "unable to send status");
        }
    }
    .instrument(span)
    .await
}

async fn dispatch<S: Service>(
    handler: &Handler<S>,
    send: &mut ResponseSink<S::Res>,
    recv: RequestSource<S::Req>,
) -> Result<(), RpcError> {
    match handler {
        Handler::Unary(f) => unary::serve::<S>(f, send, recv).await,
        Handler::ServerStreaming(f) => server_streaming::serve::<S>(f, send, recv).await,
        Handler::ClientStreaming(f) => client_streaming::serve::<S>(f, send, recv).await,
        Handler::BidiStreaming(f) => bidi_streaming::serve::<S>(f, send, recv).await,
    }
}

/// A tcp listener for the given [`Service`]
#[cfg(feature = "tcp-transport")]
pub type TcpServiceListener<S> = crate::transport::tcp::TcpListener<
    Request<<S as Service>::Req>,
    Response<<S as Service>::Res>,
>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn source(items: Vec<Request<u32>>) -> RequestSource<u32> {
        Box::pin(futures_lite::stream::iter(items.into_iter().map(Ok::<_, RpcError>)))
    }

    #[tokio::test]
    async fn read_single_wants_one_item_and_finish() {
        let mut ok = source(vec![Request::Item(1), Request::Finish]);
        assert_eq!(read_single(&mut ok).await, Ok(1));

        let mut two = source(vec![Request::Item(1), Request::Item(2)]);
        assert_eq!(read_single(&mut two).await.unwrap_err().code, Code::InvalidArgument);

        let mut none = source(vec![Request::Finish]);
        assert_eq!(read_single(&mut none).await.unwrap_err().code, Code::InvalidArgument);

        let mut gone = source(vec![Request::Item(1)]);
        assert_eq!(read_single(&mut gone).await.unwrap_err().code, Code::Cancelled);
    }

    #[tokio::test]
    async fn pump_forwards_until_finish() {
        let (tx, requests) = RequestStream::channel();
        let sent = [Request::Item(1), Request::Item(2), Request::Finish];
        let recv: RequestSource<u32> = Box::pin(
            futures_lite::stream::iter(sent.map(Ok::<_, RpcError>))
                .chain(futures_lite::stream::pending()),
        );
        let items = tokio::select! {
            error = pump(recv, Some(tx)) => panic!("pump ended early: {error:?}"),
            items = requests.collect::<Vec<_>>() => items,
        };
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn pump_notices_the_caller_going_away_while_the_handler_lags() {
        let (tx, _requests) = RequestStream::channel();
        // far more than the handler buffers, and nobody reads them
        let recv = source((0..REQUEST_BUFFER as u32 * 4).map(Request::Item).collect());
        let error = tokio::time::timeout(Duration::from_secs(5), pump(recv, Some(tx)))
            .await
            .expect("pump is stuck behind the handler");
        assert_eq!(error.code, Code::Cancelled);
    }

    #[tokio::test]
    async fn pump_rejects_protocol_violations() {
        let (tx, _requests) = RequestStream::channel();
        let twice = source(vec![Request::Item(1), Request::Finish, Request::Finish]);
        assert_eq!(pump(twice, Some(tx)).await.code, Code::InvalidArgument);

        let reopened = source(vec![Request::Open {
            route: "again".into(),
            pattern: Pattern::Unary,
        }]);
        assert_eq!(pump(reopened, None).await.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn pump_rejects_items_after_finish() {
        let recv = source(vec![Request::Item(1)]);
        let error = pump(recv, None).await;
        assert_eq!(error.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let res: Result<u32, RpcError> = guarded(|| panic!("boom")).await;
        assert_eq!(res.unwrap_err().code, Code::Internal);

        let res: Result<u32, RpcError> = guarded(|| {
            async {
                if true {
                    panic!("boom");
                }
                Ok(1)
            }
            .boxed()
        })
        .await;
        assert_eq!(res.unwrap_err().code, Code::Internal);

        let stream = guarded_stream(|| {
            futures_lite::stream::iter(0..3u32)
                .map(|i| if i == 2 { panic!("boom") } else { Ok(i) })
                .boxed()
        });
        let items = stream.collect::<Vec<_>>().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].as_ref().unwrap_err().code, Code::Internal);
    }

    #[test]
    fn re_registering_a_route_replaces_the_handler() {
        #[derive(Debug, Clone)]
        struct Numbers;
        impl Service for Numbers {
            type Req = u32;
            type Res = u32;
        }
        let router = Router::<Numbers>::new()
            .unary("double", |x| async move { Ok(x * 2) })
            .server_streaming("double", |x| futures_lite::stream::once(Ok(x * 2)));
        let routes = router.routes().collect::<Vec<_>>();
        assert_eq!(routes, vec![("double", Pattern::ServerStreaming)]);
    }
}
