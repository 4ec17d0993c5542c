//! Unary interaction pattern.
//!
//! There is exactly one request and exactly one response.
use crate::{
    exchange::{send_single, single, ResponseStream},
    message::{Pattern, Response},
    server::{guarded, pump, race2, read_single, RequestSource, ResponseSink, UnaryFn},
    transport::ServiceConnector,
    Connection, RpcError, Service,
};

use futures_util::{FutureExt, SinkExt};

impl<S, C> Connection<S, C>
where
    S: Service,
    C: ServiceConnector<S>,
{
    /// Unary call: send one request, wait for one response.
    ///
    /// Either the response or an error is returned, never a partial result.
    pub async fn unary(&self, route: &str, request: S::Req) -> Result<S::Res, RpcError> {
        let (ctx, mut send, recv) = self.open_exchange(route, Pattern::Unary).await?;
        send_single(&mut send, request).await;
        single(ResponseStream::new(ctx, send, recv)).await
    }
}

pub(crate) async fn serve<S: Service>(
    f: &UnaryFn<S>,
    send: &mut ResponseSink<S::Res>,
    mut recv: RequestSource<S::Req>,
) -> Result<(), RpcError> {
    let request = read_single(&mut recv).await?;
    // any further request envelope ends the call
    let cancel = pump(recv, None).map(Err);
    let response = race2(cancel, guarded(|| f(request))).await?;
    send.send(Response::Item(response)).await
}
