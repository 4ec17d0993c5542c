//! Server streaming interaction pattern.
//!
//! One request, then a stream of responses paced by the handler.
use futures_util::FutureExt;

use crate::{
    exchange::{send_single, ResponseStream},
    message::Pattern,
    server::{forward, guarded_stream, pump, race2, read_single, RequestSource, ResponseSink, ServerStreamingFn},
    transport::ServiceConnector,
    Connection, RpcError, Service,
};

impl<S, C> Connection<S, C>
where
    S: Service,
    C: ServiceConnector<S>,
{
    /// Server streaming call: send one request, get a stream of responses.
    ///
    /// The stream is lazy. Dropping it before it ended cancels the call, which
    /// the handler observes.
    pub async fn server_streaming(
        &self,
        route: &str,
        request: S::Req,
    ) -> Result<ResponseStream<S::Res>, RpcError> {
        let (ctx, mut send, recv) = self.open_exchange(route, Pattern::ServerStreaming).await?;
        send_single(&mut send, request).await;
        // keep send alive so the handler does not see a cancellation
        Ok(ResponseStream::new(ctx, send, recv))
    }
}

pub(crate) async fn serve<S: Service>(
    f: &ServerStreamingFn<S>,
    send: &mut ResponseSink<S::Res>,
    mut recv: RequestSource<S::Req>,
) -> Result<(), RpcError> {
    let request = read_single(&mut recv).await?;
    let cancel = pump(recv, None).map(Err);
    let responses = guarded_stream(|| f(request));
    race2(cancel, forward(responses, send)).await
}
