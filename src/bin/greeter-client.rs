//! Greeter client
//!
//! Calls every greeter route once and prints what comes back. Usage:
//! `greeter-client [server address]`
use std::time::Duration;

use anyhow::Context;
use futures_lite::StreamExt;
use futures_util::SinkExt;
use pattern_rpc::{
    client::TcpServiceConnector,
    greeter::{
        GreeterService, HelloRequest, CLIENT_STREAM_HELLO, DEFAULT_PORT, EVERYBODY_STREAMS_HELLO,
        SAY_HELLO, SERVER_STREAM_HELLO,
    },
    ConnectOptions, Connection, RpcError,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

type GreeterConnection = Connection<GreeterService, TcpServiceConnector<GreeterService>>;

const NAMES: [&str; 5] = ["josue", "cesar", "oscar", "alejandro", "noe"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("localhost:{DEFAULT_PORT}"));
    let conn = GreeterConnection::open(addr.as_str(), ConnectOptions::default())
        .await
        .with_context(|| format!("unable to connect to {addr}"))?;

    say_hello(&conn, "josue Garcia says hello").await;
    server_streams_hello(&conn, "josue Garcia").await;
    client_ask_for_hello(&conn, &NAMES).await;
    everybody_says_hello_back(&conn, &NAMES).await;

    conn.close(Duration::from_secs(5)).await;
    Ok(())
}

async fn say_hello(conn: &GreeterConnection, name: &str) {
    match conn.unary(SAY_HELLO, HelloRequest::new(name)).await {
        Ok(response) => println!("sayHello response: {}", response.message),
        Err(e) => println!("error sayHello {e} status: {}", e.code),
    }
}

async fn server_streams_hello(conn: &GreeterConnection, name: &str) {
    let res = async {
        let mut responses = conn
            .server_streaming(SERVER_STREAM_HELLO, HelloRequest::new(name))
            .await?;
        while let Some(response) = responses.next().await {
            let response = response?;
            println!("serverStreamsHello: {} response: {response:?}", response.message);
        }
        Ok::<_, RpcError>(())
    }
    .await;
    if let Err(e) = res {
        println!("error serverStreamsHello {e} status: {}", e.code);
    }
}

async fn client_ask_for_hello(conn: &GreeterConnection, names: &[&str]) {
    let requests = futures_lite::stream::iter(names.iter().copied()).then(|name| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        HelloRequest::new(name)
    });
    match conn.client_streaming_from(CLIENT_STREAM_HELLO, requests).await {
        Ok(response) => println!("clientAskForHello: {}  response: {response:?}", response.message),
        Err(e) => println!("error clientAskForHello {e} status: {}", e.code),
    }
}

async fn everybody_says_hello_back(conn: &GreeterConnection, names: &[&str]) {
    let res = async {
        let (mut requests, mut responses) = conn.bidi_streaming(EVERYBODY_STREAMS_HELLO).await?;
        let producer = async move {
            for name in names {
                tokio::time::sleep(Duration::from_millis(100)).await;
                requests.send(HelloRequest::new(*name)).await?;
            }
            requests.close().await
        };
        let consumer = async {
            while let Some(response) = responses.next().await {
                let response = response?;
                println!(
                    "everyBodySaysHelloBack {}, response: {response:?}",
                    response.message
                );
            }
            Ok::<_, RpcError>(())
        };
        let (produced, consumed) = tokio::join!(producer, consumer);
        if let Err(cause) = produced {
            debug!(%cause, "sending greetings stopped");
        }
        consumed
    }
    .await;
    if let Err(e) = res {
        println!("error everyBodySaysHelloBack {e} status: {}", e.code);
    }
}
