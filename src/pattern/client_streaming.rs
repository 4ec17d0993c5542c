//! Client streaming interaction pattern.
//!
//! A stream of requests, then one response once the requests are finished.
use futures_lite::{Stream, StreamExt};
use futures_util::{FutureExt, SinkExt};
use tracing::debug;

use crate::{
    exchange::{single, split, RequestSink, ResponseFuture},
    message::{Pattern, Response},
    server::{guarded, pump, race2, ClientStreamingFn, RequestSource, RequestStream, ResponseSink},
    transport::ServiceConnector,
    Connection, RpcError, Service,
};

impl<S, C> Connection<S, C>
where
    S: Service,
    C: ServiceConnector<S>,
{
    /// Client streaming call: send a stream of requests, get one response.
    ///
    /// Requests are sent through the returned [`RequestSink`]. The handler
    /// produces its response after the sink was closed. Pacing the requests is
    /// up to the caller.
    ///
    /// Dropping the sink without closing it, or dropping the response future,
    /// cancels the call.
    pub async fn client_streaming(
        &self,
        route: &str,
    ) -> Result<(RequestSink<S::Req>, ResponseFuture<S::Res>), RpcError> {
        let (ctx, send, recv) = self.open_exchange(route, Pattern::ClientStreaming).await?;
        let (requests, responses) = split(ctx, send, recv);
        Ok((requests, single(responses).boxed()))
    }

    /// Client streaming call that sends every item of `requests`.
    ///
    /// The requests are finished when the stream ends. If the handler answers
    /// or fails before all requests were sent, the remaining ones are not
    /// sent.
    pub async fn client_streaming_from<R>(&self, route: &str, requests: R) -> Result<S::Res, RpcError>
    where
        R: Stream<Item = S::Req> + Send,
    {
        let (mut sink, mut response) = self.client_streaming(route).await?;
        let feed = async move {
            let mut requests = std::pin::pin!(requests);
            while let Some(request) = requests.next().await {
                sink.send(request).await?;
            }
            sink.close().await
        };
        tokio::select! {
            res = &mut response => return res,
            fed = feed => if let Err(cause) = fed {
                debug!(%cause, "request stream interrupted");
            },
        }
        response.await
    }
}

pub(crate) async fn serve<S: Service>(
    f: &ClientStreamingFn<S>,
    send: &mut ResponseSink<S::Res>,
    recv: RequestSource<S::Req>,
) -> Result<(), RpcError> {
    let (items, requests) = RequestStream::channel();
    let cancel = pump(recv, Some(items)).map(Err);
    let response = race2(cancel, guarded(|| f(requests))).await?;
    send.send(Response::Item(response)).await
}
