//! Services and helpers shared by the integration tests
#![allow(dead_code, unused_imports)]
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use async_stream::stream;
use futures_lite::{Stream, StreamExt};
use futures_util::SinkExt;
use pattern_rpc::{
    greeter::{
        Greeter, GreeterService, HelloRequest, CLIENT_STREAM_HELLO, EVERYBODY_STREAMS_HELLO,
        SAY_HELLO, SERVER_STREAM_HELLO,
    },
    message::{Request, Response},
    transport::ServiceConnector,
    Connection, Router, RpcError, RpcServer, Service, ShutdownHandle,
};

pub const NAMES: [&str; 5] = ["josue", "cesar", "oscar", "alejandro", "noe"];

/// Length of the server stream of [fast_greeter]
pub const STREAM_LEN: usize = 4;

#[cfg(feature = "flume-transport")]
pub type FlumeConnection<S> = Connection<
    S,
    pattern_rpc::transport::flume::FlumeConnector<
        Response<<S as Service>::Res>,
        Request<<S as Service>::Req>,
    >,
>;

/// A greeter that does not keep the tests waiting
pub fn fast_greeter(stream_len: usize) -> Greeter {
    Greeter {
        stream_len,
        stream_interval: Duration::from_millis(1),
    }
}

/// Greetings the server stream of the greeter produces for `name`
pub fn expected_stream(name: &str, len: usize) -> Vec<String> {
    (0..len)
        .map(|x| format!("hola bienvenido, server streams hello, {name} - {x}"))
        .collect()
}

/// Serve `router` over the memory transport
#[cfg(feature = "flume-transport")]
pub fn serve_flume<S: Service>(
    router: Router<S>,
    grace_period: Duration,
) -> (FlumeConnection<S>, ShutdownHandle) {
    let (listener, connector) = pattern_rpc::transport::flume::channel::<Request<S::Req>, Response<S::Res>>(1);
    let server = RpcServer::new(listener, router).with_grace_period(grace_period);
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());
    (Connection::new(connector), shutdown)
}

/// Wait until the server is not handling any exchange anymore
pub async fn settled(shutdown: &ShutdownHandle) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while shutdown.active() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("{} exchanges still running", shutdown.active()))
}

/// Call every greeter route once, with the routes of [fast_greeter]
pub async fn greeter_smoke<C>(conn: &Connection<GreeterService, C>) -> anyhow::Result<()>
where
    C: ServiceConnector<GreeterService>,
{
    // unary
    let res = conn.unary(SAY_HELLO, HelloRequest::new("X")).await?;
    assert_eq!(res.message, "hola bienvenido X");

    // server streaming
    let messages = conn
        .server_streaming(SERVER_STREAM_HELLO, HelloRequest::new("josue Garcia"))
        .await?
        .map(|res| res.map(|res| res.message))
        .try_collect::<_, _, Vec<_>>()
        .await?;
    assert_eq!(messages, expected_stream("josue Garcia", STREAM_LEN));

    // client streaming
    let requests = futures_lite::stream::iter(NAMES.map(HelloRequest::new));
    let res = conn
        .client_streaming_from(CLIENT_STREAM_HELLO, requests)
        .await?;
    assert_eq!(
        res.message,
        "hola josue,cesar,oscar,alejandro,noe bienvenidos todos."
    );

    // bidi streaming, every response arrives before the next request is sent
    let (mut send, mut recv) = conn.bidi_streaming(EVERYBODY_STREAMS_HELLO).await?;
    for name in NAMES {
        send.send(HelloRequest::new(name)).await?;
        let res = recv.next().await.context("response stream ended early")??;
        assert_eq!(res.message, format!("hello {name} everybody is saying hi "));
    }
    send.close().await?;
    assert!(recv.next().await.is_none());
    Ok(())
}

/// A service over plain numbers with handlers that misbehave in various ways
#[derive(Debug, Clone)]
pub struct ProbeService;

impl Service for ProbeService {
    type Req = u64;
    type Res = u64;
}

/// Handlers of the [ProbeService]. Counts how often a handler was invoked.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    calls: Arc<AtomicUsize>,
}

impl Probe {
    /// Number of handler invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) -> impl Fn() + Send + Sync + 'static {
        let calls = self.calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn router(&self) -> Router<ProbeService> {
        let sleep = self.hit();
        let fail = self.hit();
        let panics = self.hit();
        let count = self.hit();
        let count_then_fail = self.hit();
        let forever = self.hit();
        let sum = self.hit();
        let hang = self.hit();
        let echo = self.hit();
        Router::new()
            .unary("sleep", move |ms| {
                sleep();
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                }
            })
            .unary("fail", move |x| {
                fail();
                async move {
                    if x % 2 == 1 {
                        return Err(RpcError::invalid_argument(format!("{x} is odd")));
                    }
                    Ok(x)
                }
            })
            .unary("panic", move |x: u64| {
                panics();
                async move {
                    if x < u64::MAX {
                        panic!("handler panicked on purpose");
                    }
                    Ok(x)
                }
            })
            .server_streaming("count", move |n| {
                count();
                numbers(n)
            })
            .server_streaming("count_then_fail", move |n| {
                count_then_fail();
                numbers(n).chain(futures_lite::stream::once(Err(RpcError::internal(
                    "ran out of numbers",
                ))))
            })
            .server_streaming("forever", move |_| {
                forever();
                stream! {
                    yield Ok(0);
                    std::future::pending::<()>().await;
                }
            })
            .client_streaming("sum", move |requests| {
                sum();
                async move { Ok(requests.fold(0, |acc, x| acc + x).await) }
            })
            .client_streaming("hang", move |requests| {
                hang();
                async move {
                    let _requests = requests;
                    std::future::pending::<Result<u64, RpcError>>().await
                }
            })
            .bidi_streaming("echo", move |requests| {
                echo();
                requests.map(Ok)
            })
    }
}

fn numbers(n: u64) -> impl Stream<Item = Result<u64, RpcError>> + Send + 'static {
    futures_lite::stream::iter(0..n).map(Ok)
}
