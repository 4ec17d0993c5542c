//! Greeter demo service
//!
//! A small service with one route per interaction pattern. It is served by
//! the `greeter-server` binary and called by the `greeter-client` binary.
use std::time::Duration;

use futures_lite::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{RequestStream, Router, RpcError, Service};

/// Route of the unary greeting
pub const SAY_HELLO: &str = "say_hello";
/// Route of the server streaming greeting
pub const SERVER_STREAM_HELLO: &str = "server_stream_hello";
/// Route of the client streaming greeting
pub const CLIENT_STREAM_HELLO: &str = "client_stream_hello";
/// Route of the bidi streaming greeting
pub const EVERYBODY_STREAMS_HELLO: &str = "everybody_streams_hello";

/// Default port of the greeter server
pub const DEFAULT_PORT: u16 = 8085;

/// Request of every greeter route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Who to greet
    pub name: String,
}

impl HelloRequest {
    /// Create a request for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Response of every greeter route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    /// The greeting
    pub message: String,
}

/// The greeter service
#[derive(Debug, Clone)]
pub struct GreeterService;

impl Service for GreeterService {
    type Req = HelloRequest;
    type Res = HelloResponse;
}

/// Handlers of the greeter service
#[derive(Debug, Clone)]
pub struct Greeter {
    /// Number of greetings of the server stream
    pub stream_len: usize,
    /// Delay before each greeting of the server stream
    pub stream_interval: Duration,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            stream_len: 16,
            stream_interval: Duration::from_millis(100),
        }
    }
}

impl Greeter {
    /// Register all greeter routes on a new router
    pub fn router(self) -> Router<GreeterService> {
        Router::new()
            .unary(SAY_HELLO, |req| async move { Ok(say_hello(req)) })
            .server_streaming(SERVER_STREAM_HELLO, move |req| self.server_stream_hello(req))
            .client_streaming(CLIENT_STREAM_HELLO, client_stream_hello)
            .bidi_streaming(EVERYBODY_STREAMS_HELLO, everybody_streams_hello)
    }

    fn server_stream_hello(
        &self,
        req: HelloRequest,
    ) -> impl Stream<Item = Result<HelloResponse, RpcError>> + Send + 'static {
        let Greeter {
            stream_len,
            stream_interval,
        } = self.clone();
        async_stream::stream! {
            for x in 0..stream_len {
                tokio::time::sleep(stream_interval).await;
                yield Ok(HelloResponse {
                    message: format!("hola bienvenido, server streams hello, {} - {x}", req.name),
                });
            }
        }
    }
}

fn say_hello(req: HelloRequest) -> HelloResponse {
    HelloResponse {
        message: format!("hola bienvenido {}", req.name),
    }
}

async fn client_stream_hello(requests: RequestStream<HelloRequest>) -> Result<HelloResponse, RpcError> {
    let names = requests.map(|req| req.name).collect::<Vec<_>>().await;
    Ok(HelloResponse {
        message: format!("hola {} bienvenidos todos.", names.join(",")),
    })
}

fn everybody_streams_hello(
    requests: RequestStream<HelloRequest>,
) -> impl Stream<Item = Result<HelloResponse, RpcError>> + Send + 'static {
    requests.map(|req| {
        debug!(name = %req.name, "hello from");
        Ok(HelloResponse {
            message: format!("hello {} everybody is saying hi ", req.name),
        })
    })
}
