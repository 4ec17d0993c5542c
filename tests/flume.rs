#![cfg(feature = "flume-transport")]
mod fixture;
use std::time::Duration;

use anyhow::Context;
use fixture::*;
use futures_lite::StreamExt;
use futures_util::SinkExt;
use pattern_rpc::{
    greeter::{GreeterService, HelloRequest, CLIENT_STREAM_HELLO, SERVER_STREAM_HELLO},
    Code, ExchangeStatus,
};

const GRACE: Duration = Duration::from_secs(1);

/// simple happy path test for all 4 patterns
#[tokio::test]
async fn flume_greeter_smoke() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, _shutdown) = serve_flume(fast_greeter(STREAM_LEN).router(), GRACE);
    greeter_smoke(&conn).await
}

#[tokio::test]
async fn flume_server_stream_order() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    for len in [0, 1, 16] {
        let (conn, _shutdown) = serve_flume::<GreeterService>(fast_greeter(len).router(), GRACE);
        let mut responses = conn
            .server_streaming(SERVER_STREAM_HELLO, HelloRequest::new("josue"))
            .await?;
        let mut messages = Vec::new();
        while let Some(res) = responses.next().await {
            messages.push(res?.message);
        }
        assert_eq!(messages, expected_stream("josue", len));
        assert_eq!(responses.status(), ExchangeStatus::Completed);
    }
    Ok(())
}

#[tokio::test]
async fn flume_client_stream_sees_every_item() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, _shutdown) = serve_flume(fast_greeter(STREAM_LEN).router(), GRACE);
    let cases: [(&[&str], &str); 3] = [
        (&[], "hola  bienvenidos todos."),
        (&["josue"], "hola josue bienvenidos todos."),
        (&NAMES, "hola josue,cesar,oscar,alejandro,noe bienvenidos todos."),
    ];
    for (names, expected) in cases {
        let (mut send, response) = conn.client_streaming(CLIENT_STREAM_HELLO).await?;
        for name in names {
            // pacing is up to the caller
            tokio::time::sleep(Duration::from_millis(10)).await;
            send.send(HelloRequest::new(*name)).await?;
        }
        send.close().await?;
        assert_eq!(response.await?.message, expected);
    }
    Ok(())
}

#[tokio::test]
async fn flume_bidi_is_duplex() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let probe = Probe::default();
    let (conn, shutdown) = serve_flume(probe.router(), GRACE);
    let (mut send, mut recv) = conn.bidi_streaming("echo").await?;
    for i in 0..10 {
        send.send(i).await?;
        // the response to request i arrives before request i + 1 is sent
        let echoed = recv.next().await.context("response stream ended early")??;
        assert_eq!(echoed, i);
    }
    send.close().await?;
    assert!(recv.next().await.is_none());
    assert_eq!(recv.status(), ExchangeStatus::Completed);
    settled(&shutdown).await
}

#[tokio::test]
async fn flume_client_stream_sum() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, _shutdown) = serve_flume(Probe::default().router(), GRACE);
    let res = conn
        .client_streaming_from("sum", futures_lite::stream::iter(1..=100))
        .await?;
    assert_eq!(res, 5050);
    Ok(())
}

#[tokio::test]
async fn flume_unknown_route_is_unimplemented() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let probe = Probe::default();
    let (conn, _shutdown) = serve_flume(probe.router(), GRACE);

    let err = conn.unary("nope", 1).await.unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);

    let mut responses = conn.server_streaming("nope", 1).await?;
    let err = responses.next().await.context("no status")?.unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);
    assert!(responses.next().await.is_none());

    let (mut send, response) = conn.client_streaming("nope").await?;
    // the handler side may already be gone, sending is allowed to fail
    send.send(1).await.ok();
    send.close().await.ok();
    assert_eq!(response.await.unwrap_err().code, Code::Unimplemented);

    assert_eq!(probe.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn flume_pattern_mismatch_is_invalid_argument() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let probe = Probe::default();
    let (conn, _shutdown) = serve_flume(probe.router(), GRACE);
    // count is a server streaming route
    let err = conn.unary("count", 3).await.unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(probe.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn flume_handler_errors_reach_the_caller() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, _shutdown) = serve_flume(Probe::default().router(), GRACE);
    assert_eq!(conn.unary("fail", 2).await?, 2);
    let err = conn.unary("fail", 3).await.unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(err.message, "3 is odd");

    // items before the error stay valid
    let mut responses = conn.server_streaming("count_then_fail", 3).await?;
    for i in 0..3 {
        assert_eq!(responses.next().await.context("missing item")??, i);
    }
    let err = responses.next().await.context("missing error")?.unwrap_err();
    assert_eq!(err.code, Code::Internal);
    assert!(responses.next().await.is_none());
    assert!(matches!(responses.status(), ExchangeStatus::Failed(_)));
    Ok(())
}

#[tokio::test]
async fn flume_handler_panic_is_internal() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, shutdown) = serve_flume(Probe::default().router(), GRACE);
    let err = conn.unary("panic", 1).await.unwrap_err();
    assert_eq!(err.code, Code::Internal);
    // the server survives
    assert_eq!(conn.unary("sleep", 1).await?, 1);
    settled(&shutdown).await
}

#[tokio::test]
async fn flume_concurrent_exchanges() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (conn, shutdown) = serve_flume(Probe::default().router(), GRACE);
    let calls = (0..100u64).map(|i| {
        let conn = conn.clone();
        tokio::spawn(async move { conn.unary("sleep", i % 10).await })
    });
    for (i, call) in calls.collect::<Vec<_>>().into_iter().enumerate() {
        assert_eq!(call.await??, i as u64 % 10);
    }
    assert_eq!(conn.active_exchanges(), 0);
    settled(&shutdown).await
}
