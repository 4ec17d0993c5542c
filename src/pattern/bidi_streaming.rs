//! Bidirectional stream interaction pattern.
//!
//! Requests and responses flow independently in both directions.
use futures_util::FutureExt;

use crate::{
    exchange::{split, RequestSink, ResponseStream},
    message::Pattern,
    server::{forward, guarded_stream, pump, race2, BidiStreamingFn, RequestSource, RequestStream, ResponseSink},
    transport::ServiceConnector,
    Connection, RpcError, Service,
};

impl<S, C> Connection<S, C>
where
    S: Service,
    C: ServiceConnector<S>,
{
    /// Bidi streaming call: a stream of requests and a stream of responses.
    ///
    /// Both directions are independent. Closing the [`RequestSink`] only ends
    /// the requests; responses keep arriving until the handler is done.
    /// Dropping the sink without closing it, or dropping the response stream
    /// before it ended, cancels the call.
    pub async fn bidi_streaming(
        &self,
        route: &str,
    ) -> Result<(RequestSink<S::Req>, ResponseStream<S::Res>), RpcError> {
        let (ctx, send, recv) = self.open_exchange(route, Pattern::BidiStreaming).await?;
        Ok(split(ctx, send, recv))
    }
}

pub(crate) async fn serve<S: Service>(
    f: &BidiStreamingFn<S>,
    send: &mut ResponseSink<S::Res>,
    recv: RequestSource<S::Req>,
) -> Result<(), RpcError> {
    let (items, requests) = RequestStream::channel();
    let cancel = pump(recv, Some(items)).map(Err);
    let responses = guarded_stream(|| f(requests));
    race2(cancel, forward(responses, send)).await
}
