//! Caller side of an exchange
//!
//! An exchange is opened by one of the pattern drivers on
//! [`Connection`](crate::Connection). The caller gets a [`ResponseStream`]
//! for the response direction and, for the patterns that stream requests, a
//! [`RequestSink`] for the request direction.
//!
//! The raw send half of the transport is kept alive until the exchange is
//! over. A send half that goes away without a `Finish` is how the handler
//! learns that the caller gave up, so dropping a [`ResponseStream`] (or a
//! [`RequestSink`] that was not closed) cancels the call.
//!
//! Both raw halves are shared with the connection the exchange was opened
//! on. Closing the connection releases them, even if nobody polls the
//! exchange anymore.
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::{future::Boxed, Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{ready, SinkExt};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFutureOwned},
    task::task_tracker::TaskTrackerToken,
};
use tracing::trace;

use crate::{
    lock,
    message::{Request, Response},
    RpcError,
};

/// Boxed send half of an exchange, errors already mapped to [`RpcError`]
pub(crate) type BoxSendSink<T> =
    Pin<Box<dyn Sink<Request<T>, Error = RpcError> + Send + Sync + 'static>>;

/// Boxed receive half of an exchange, errors already mapped to [`RpcError`]
pub(crate) type BoxRecvStream<T> =
    Pin<Box<dyn Stream<Item = Result<Response<T>, RpcError>> + Send + Sync + 'static>>;

/// Exchanges of a connection that are not released yet, by id
pub(crate) type Registry = Mutex<HashMap<u64, Weak<dyn Release>>>;

/// Future for the single response of a client streaming call.
///
/// Dropping it cancels the call.
pub type ResponseFuture<T> = Boxed<Result<T, RpcError>>;

/// Completion status of an exchange, as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// The exchange is still running
    Pending,
    /// The handler finished successfully and all responses were delivered
    Completed,
    /// The exchange failed. No further items are delivered.
    Failed(RpcError),
}

/// Everything an exchange needs from the connection it was opened on.
pub(crate) struct ExchangeContext {
    pub(crate) id: u64,
    // keeps the connection's tracker from considering us finished, until bound
    token: Option<TaskTrackerToken>,
    registry: Arc<Registry>,
    abort: CancellationToken,
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl ExchangeContext {
    pub(crate) fn new(
        id: u64,
        token: TaskTrackerToken,
        registry: Arc<Registry>,
        abort: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            token: Some(token),
            registry,
            aborted: Box::pin(abort.clone().cancelled_owned()),
            abort,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
        }
    }

    /// Hand the raw halves over to a new [Halves] known to the connection.
    fn bind<Req: Send + 'static, Res: Send + 'static>(
        &mut self,
        send: BoxSendSink<Req>,
        recv: BoxRecvStream<Res>,
    ) -> Arc<Halves<Req, Res>> {
        let halves = Arc::new(Halves {
            id: self.id,
            send: Mutex::new(Some(send)),
            recv: Mutex::new(Some(recv)),
            token: Mutex::new(self.token.take()),
            registry: Arc::downgrade(&self.registry),
        });
        let weak: Weak<dyn Release> = Arc::<Halves<Req, Res>>::downgrade(&halves);
        lock(&self.registry).insert(self.id, weak);
        // the connection may have released its exchanges before we got here
        if self.abort.is_cancelled() {
            halves.release();
        }
        halves
    }

    /// Resolves once the exchange must be torn down from the outside.
    fn poll_interrupt(&mut self, cx: &mut Context<'_>) -> Poll<RpcError> {
        if self.aborted.as_mut().poll(cx).is_ready() {
            return Poll::Ready(RpcError::aborted_on_shutdown());
        }
        if let Some(deadline) = self.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(RpcError::deadline_exceeded("call deadline elapsed"));
            }
        }
        Poll::Pending
    }

    /// Like [ExchangeContext::poll_interrupt], without registering for wakeups.
    fn interrupted(&self) -> Option<RpcError> {
        if self.abort.is_cancelled() {
            return Some(RpcError::aborted_on_shutdown());
        }
        match &self.deadline {
            Some(deadline) if deadline.is_elapsed() => {
                Some(RpcError::deadline_exceeded("call deadline elapsed"))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Something the connection can release when it is closed
pub(crate) trait Release: Send + Sync {
    /// Drop both raw halves. Idempotent.
    fn release(&self);
}

/// The raw halves of an exchange.
///
/// Shared by the [`RequestSink`], the [`ResponseStream`] and the registry of
/// the connection. Whoever finishes the exchange first releases them.
pub(crate) struct Halves<Req, Res> {
    id: u64,
    send: Mutex<Option<BoxSendSink<Req>>>,
    recv: Mutex<Option<BoxRecvStream<Res>>>,
    token: Mutex<Option<TaskTrackerToken>>,
    registry: Weak<Registry>,
}

impl<Req, Res> Release for Halves<Req, Res> {
    fn release(&self) {
        lock(&self.send).take();
        lock(&self.recv).take();
        lock(&self.token).take();
    }
}

impl<Req, Res> Drop for Halves<Req, Res> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

/// Typed access to the receive half, for the [`ResponseStream`]
trait RecvHalf<T>: Release {
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Response<T>, RpcError>>>;
}

impl<Req, Res> RecvHalf<Res> for Halves<Req, Res> {
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Response<Res>, RpcError>>> {
        match lock(&self.recv).as_mut() {
            Some(recv) => recv.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Typed access to the send half, for the [`RequestSink`]
trait SendHalf<T>: Release {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>>;
    fn start_send(&self, item: Request<T>) -> Result<(), RpcError>;
    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>>;
    /// Drop the send half only, the handler sees the caller go away
    fn cancel_send(&self);
}

fn send_closed() -> RpcError {
    RpcError::cancelled("request direction already closed")
}

impl<Req, Res> SendHalf<Req> for Halves<Req, Res> {
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        match lock(&self.send).as_mut() {
            Some(send) => send.poll_ready_unpin(cx),
            None => Poll::Ready(Err(send_closed())),
        }
    }

    fn start_send(&self, item: Request<Req>) -> Result<(), RpcError> {
        match lock(&self.send).as_mut() {
            Some(send) => send.start_send_unpin(item),
            None => Err(send_closed()),
        }
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<Result<(), RpcError>> {
        match lock(&self.send).as_mut() {
            Some(send) => send.poll_flush_unpin(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn cancel_send(&self) {
        lock(&self.send).take();
    }
}

/// Lazy sequence of responses of an exchange.
///
/// Items are yielded in exactly the order the handler produced them. The
/// stream ends after the handler reported success. If the exchange fails, the
/// stream yields one `Err` and ends; items yielded before remain valid.
///
/// Dropping the stream before it ended cancels the exchange, and so does
/// [`ResponseStream::cancel`].
pub struct ResponseStream<T> {
    halves: Option<Arc<dyn RecvHalf<T>>>,
    ctx: Option<ExchangeContext>,
    status: ExchangeStatus,
}

impl<T> fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("ctx", &self.ctx)
            .field("status", &self.status)
            .finish()
    }
}

impl<T: Send + 'static> ResponseStream<T> {
    /// Response side of a single request exchange, which owns both halves.
    pub(crate) fn new<Req: Send + 'static>(
        mut ctx: ExchangeContext,
        send: BoxSendSink<Req>,
        recv: BoxRecvStream<T>,
    ) -> Self {
        let halves = ctx.bind(send, recv);
        Self::bound(ctx, halves)
    }

    fn bound(ctx: ExchangeContext, halves: Arc<dyn RecvHalf<T>>) -> Self {
        Self {
            halves: Some(halves),
            ctx: Some(ctx),
            status: ExchangeStatus::Pending,
        }
    }
}

impl<T> ResponseStream<T> {
    /// Current status of the exchange.
    ///
    /// An exchange that was aborted or ran past its deadline reports so even
    /// if the stream is not polled anymore.
    pub fn status(&self) -> ExchangeStatus {
        match (&self.status, &self.ctx) {
            (ExchangeStatus::Pending, Some(ctx)) => match ctx.interrupted() {
                Some(error) => ExchangeStatus::Failed(error),
                None => ExchangeStatus::Pending,
            },
            (status, _) => status.clone(),
        }
    }

    /// Cancel the exchange.
    ///
    /// Both directions are released immediately, which the handler observes as
    /// cancellation. Calling this on a finished exchange does nothing.
    pub fn cancel(&mut self) {
        if self.status == ExchangeStatus::Pending {
            self.finish(ExchangeStatus::Failed(RpcError::cancelled(
                "cancelled by caller",
            )));
        }
    }

    fn finish(&mut self, status: ExchangeStatus) {
        if let Some(ctx) = &self.ctx {
            trace!(id = ctx.id, ?status, "exchange finished");
        }
        self.status = status;
        if let Some(halves) = self.halves.take() {
            halves.release();
        }
        self.ctx = None;
    }

    fn fail(&mut self, error: RpcError) -> Poll<Option<Result<T, RpcError>>> {
        self.finish(ExchangeStatus::Failed(error.clone()));
        Poll::Ready(Some(Err(error)))
    }
}

impl<T> Drop for ResponseStream<T> {
    fn drop(&mut self) {
        if let Some(halves) = self.halves.take() {
            halves.release();
        }
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let (Some(ctx), Some(halves)) = (this.ctx.as_mut(), this.halves.as_ref()) else {
            return Poll::Ready(None);
        };
        if let Poll::Ready(error) = ctx.poll_interrupt(cx) {
            return this.fail(error);
        }
        match ready!(halves.poll_recv(cx)) {
            Some(Ok(Response::Item(item))) => Poll::Ready(Some(Ok(item))),
            Some(Ok(Response::Status(Ok(())))) => {
                this.finish(ExchangeStatus::Completed);
                Poll::Ready(None)
            }
            Some(Ok(Response::Status(Err(error)))) | Some(Err(error)) => this.fail(error),
            None => this.fail(RpcError::unavailable("exchange closed before status")),
        }
    }
}

/// Both caller side handles of a streaming request exchange.
pub(crate) fn split<Req: Send + 'static, Res: Send + 'static>(
    mut ctx: ExchangeContext,
    send: BoxSendSink<Req>,
    recv: BoxRecvStream<Res>,
) -> (RequestSink<Req>, ResponseStream<Res>) {
    let halves = ctx.bind(send, recv);
    let requests = RequestSink {
        send: halves.clone(),
        finish_queued: false,
        closed: false,
    };
    (requests, ResponseStream::bound(ctx, halves))
}

/// Drain a response stream that must contain exactly one item.
pub(crate) async fn single<T>(mut responses: ResponseStream<T>) -> Result<T, RpcError> {
    let item = match responses.next().await {
        Some(item) => item?,
        None => return Err(RpcError::internal("handler completed without a response")),
    };
    match responses.next().await {
        None => Ok(item),
        Some(Err(error)) => Err(error),
        Some(Ok(_)) => {
            responses.cancel();
            Err(RpcError::internal("handler sent more than one response"))
        }
    }
}

/// Send the only request item of an exchange followed by `Finish`.
///
/// A failure here is not reported: the handler side already decided the
/// outcome and the status is on its way on the response side.
pub(crate) async fn send_single<T>(send: &mut BoxSendSink<T>, item: T) {
    let sent = async {
        send.feed(Request::Item(item)).await?;
        send.send(Request::Finish).await
    }
    .await;
    if let Err(cause) = sent {
        trace!(%cause, "request direction failed");
    }
}

/// Sink for the request items of a client streaming or bidi streaming call.
///
/// Closing the sink (e.g. with [`SinkExt::close`]) sends the explicit end of
/// the request sequence. This only ends the request direction: responses keep
/// flowing until the handler is done.
///
/// Dropping the sink without closing it cancels the whole call.
pub struct RequestSink<T> {
    send: Arc<dyn SendHalf<T>>,
    finish_queued: bool,
    closed: bool,
}

impl<T> fmt::Debug for RequestSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("closed", &self.closed)
            .field("finish_queued", &self.finish_queued)
            .finish()
    }
}

impl<T> RequestSink<T> {
    /// True once the request direction is closed or cancelled
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Cancel the call from the request side.
    ///
    /// Idempotent. Has no effect on a sink that was already closed.
    pub fn cancel(&mut self) {
        if !self.closed {
            self.closed = true;
            self.send.cancel_send();
        }
    }

    fn check_open(&self) -> Result<(), RpcError> {
        if self.closed {
            return Err(send_closed());
        }
        Ok(())
    }
}

impl<T> Drop for RequestSink<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> Sink<T> for RequestSink<T> {
    type Error = RpcError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.check_open()?;
        self.send.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.check_open()?;
        self.send.start_send(Request::Item(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        self.send.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if !this.finish_queued {
            ready!(this.send.poll_ready(cx))?;
            this.send.start_send(Request::Finish)?;
            this.finish_queued = true;
        }
        ready!(this.send.poll_flush(cx))?;
        // the send half stays with the response side until the call is over
        this.closed = true;
        Poll::Ready(Ok(()))
    }
}

/// Wait until the exchange context is interrupted. Used by tests of the context itself.
#[cfg(test)]
async fn interrupted(ctx: &mut ExchangeContext) -> RpcError {
    std::future::poll_fn(|cx| ctx.poll_interrupt(cx)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;
    use tokio_util::task::TaskTracker;

    fn ctx(abort: &CancellationToken, timeout: Option<Duration>) -> (TaskTracker, ExchangeContext) {
        let tracker = TaskTracker::new();
        let registry = Arc::new(Registry::default());
        let ctx = ExchangeContext::new(1, tracker.token(), registry, abort.child_token(), timeout);
        (tracker, ctx)
    }

    fn halves() -> (BoxSendSink<u32>, BoxRecvStream<u32>, flume::Receiver<Request<u32>>) {
        let (tx, rx) = flume::unbounded();
        let send: BoxSendSink<u32> =
            Box::pin(tx.into_sink().sink_map_err(|_| RpcError::unavailable("gone")));
        let recv: BoxRecvStream<u32> = Box::pin(futures_lite::stream::pending());
        (send, recv, rx)
    }

    #[tokio::test]
    async fn abort_interrupts_with_aborted() {
        let abort = CancellationToken::new();
        let (_tracker, mut ctx) = ctx(&abort, None);
        abort.cancel();
        let err = interrupted(&mut ctx).await;
        assert_eq!(err.code, Code::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_with_deadline_exceeded() {
        let abort = CancellationToken::new();
        let (_tracker, mut ctx) = ctx(&abort, Some(Duration::from_millis(50)));
        let err = interrupted(&mut ctx).await;
        assert_eq!(err.code, Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn dropping_the_context_releases_the_tracker() {
        let abort = CancellationToken::new();
        let (tracker, ctx) = ctx(&abort, None);
        tracker.close();
        assert_eq!(tracker.len(), 1);
        drop(ctx);
        tracker.wait().await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn releasing_from_the_registry_frees_an_idle_stream() {
        let abort = CancellationToken::new();
        let (tracker, ctx) = ctx(&abort, None);
        let registry = ctx.registry.clone();
        let (send, recv, raw) = halves();
        let responses = ResponseStream::new(ctx, send, recv);
        assert_eq!(tracker.len(), 1);

        abort.cancel();
        let pending = lock(&registry).drain().map(|(_, h)| h).collect::<Vec<_>>();
        for halves in pending.iter().filter_map(Weak::upgrade) {
            halves.release();
        }
        assert!(tracker.is_empty());
        // the handler side sees the request direction go away
        assert!(raw.recv_async().await.is_err());
        assert_eq!(
            responses.status(),
            ExchangeStatus::Failed(RpcError::aborted_on_shutdown())
        );
    }

    #[tokio::test]
    async fn closed_sink_keeps_the_request_direction_open() {
        let abort = CancellationToken::new();
        let (_tracker, ctx) = ctx(&abort, None);
        let (send, recv, raw) = halves();
        let (mut requests, responses) = split::<u32, u32>(ctx, send, recv);
        requests.send(1).await.unwrap();
        requests.close().await.unwrap();
        assert!(requests.is_closed());
        drop(requests);
        assert!(matches!(raw.recv_async().await, Ok(Request::Item(1))));
        assert!(matches!(raw.recv_async().await, Ok(Request::Finish)));
        assert!(raw.is_empty() && !raw.is_disconnected());
        // the response side owns it now
        drop(responses);
        assert!(raw.is_disconnected());
    }

    #[tokio::test]
    async fn dropping_an_unclosed_sink_cancels() {
        let abort = CancellationToken::new();
        let (_tracker, ctx) = ctx(&abort, None);
        let (send, recv, raw) = halves();
        let (requests, _responses) = split::<u32, u32>(ctx, send, recv);
        drop(requests);
        assert!(raw.is_disconnected());
    }
}
