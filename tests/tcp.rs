#![cfg(feature = "tcp-transport")]
mod fixture;
use std::{net::SocketAddr, time::Duration};

use fixture::*;
use futures_lite::StreamExt;
use pattern_rpc::{
    client::TcpServiceConnector,
    greeter::GreeterService,
    server::TcpServiceListener,
    transport::tcp::{TcpConfig, TcpListener},
    transport::LocalAddr,
    Code, ConnectError, ConnectOptions, Connection, ExchangeStatus, Listener, Router, RpcServer,
    Security, Service, ShutdownHandle,
};

type TcpConnection<S> = Connection<S, TcpServiceConnector<S>>;

/// Serve `router` on a random local port
async fn serve_tcp<S: Service>(
    router: Router<S>,
    config: TcpConfig,
    grace_period: Duration,
) -> anyhow::Result<(SocketAddr, ShutdownHandle)> {
    let listener: TcpServiceListener<S> = TcpListener::bind("127.0.0.1:0", config).await?;
    let addr = match listener.local_addr() {
        [LocalAddr::Socket(addr)] => *addr,
        other => anyhow::bail!("unexpected local addr {other:?}"),
    };
    let server = RpcServer::new(listener, router).with_grace_period(grace_period);
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());
    Ok((addr, shutdown))
}

#[tokio::test]
async fn tcp_greeter_smoke() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (addr, _shutdown) = serve_tcp(
        fast_greeter(STREAM_LEN).router(),
        TcpConfig::default(),
        Duration::from_secs(1),
    )
    .await?;
    let conn = TcpConnection::<GreeterService>::open(addr, ConnectOptions::default()).await?;
    greeter_smoke(&conn).await?;
    assert!(conn.close(Duration::from_secs(1)).await);
    Ok(())
}

#[tokio::test]
async fn tcp_many_exchanges_share_one_connection() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (addr, shutdown) = serve_tcp(
        Probe::default().router(),
        TcpConfig::default(),
        Duration::from_secs(1),
    )
    .await?;
    let conn = TcpConnection::<ProbeService>::open(addr, ConnectOptions::default()).await?;
    let calls = (0..100u64).map(|i| conn.unary("sleep", i % 10));
    let results = futures_util::future::join_all(calls).await;
    for (i, res) in results.into_iter().enumerate() {
        assert_eq!(res?, i as u64 % 10);
    }
    let streams = (0..10u64).map(|n| {
        let conn = conn.clone();
        async move {
            let responses = conn.server_streaming("count", n * 10).await?;
            responses.try_collect::<_, _, Vec<_>>().await
        }
    });
    for (n, items) in futures_util::future::join_all(streams).await.into_iter().enumerate() {
        assert_eq!(items?, (0..n as u64 * 10).collect::<Vec<_>>());
    }
    settled(&shutdown).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_unreachable_peer() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    // a port nobody listens on
    let addr = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let res = TcpConnection::<ProbeService>::open(addr, ConnectOptions::default()).await;
    assert!(matches!(res, Err(ConnectError::Unreachable(_))));
    Ok(())
}

#[tokio::test]
async fn tcp_rejects_tls() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let options = ConnectOptions {
        security: Security::Tls,
        ..Default::default()
    };
    let res = TcpConnection::<ProbeService>::open("127.0.0.1:1", options).await;
    assert!(matches!(res, Err(ConnectError::InvalidOptions(_))));
    Ok(())
}

#[tokio::test]
async fn tcp_stalled_stream_does_not_block_siblings() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let config = TcpConfig {
        window: 2,
        ..Default::default()
    };
    let (addr, shutdown) = serve_tcp(Probe::default().router(), config, Duration::from_secs(1)).await?;
    let options = ConnectOptions {
        window: 2,
        ..Default::default()
    };
    let conn = TcpConnection::<ProbeService>::open(addr, options).await?;

    // nobody reads this one for a while
    let mut stalled = conn.server_streaming("count", 1000).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let res = tokio::time::timeout(Duration::from_secs(5), conn.unary("sleep", 1)).await??;
    assert_eq!(res, 1);

    let mut expected = 0;
    while let Some(item) = stalled.next().await {
        assert_eq!(item?, expected);
        expected += 1;
    }
    assert_eq!(expected, 1000);
    assert_eq!(stalled.status(), ExchangeStatus::Completed);
    settled(&shutdown).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_cancelled_stream_releases_the_handler() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (addr, shutdown) = serve_tcp(
        Probe::default().router(),
        TcpConfig::default(),
        Duration::from_secs(1),
    )
    .await?;
    let conn = TcpConnection::<ProbeService>::open(addr, ConnectOptions::default()).await?;
    let mut responses = conn.server_streaming("forever", 0).await?;
    assert_eq!(responses.next().await.transpose()?, Some(0));
    drop(responses);
    settled(&shutdown).await?;
    // the connection is still usable
    assert_eq!(conn.unary("sleep", 1).await?, 1);
    Ok(())
}

#[tokio::test]
async fn tcp_server_shutdown() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let grace = Duration::from_millis(200);
    let (addr, shutdown) = serve_tcp(Probe::default().router(), TcpConfig::default(), grace).await?;
    let conn = TcpConnection::<ProbeService>::open(addr, ConnectOptions::default()).await?;
    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.unary("sleep", 10_000).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while shutdown.active() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    assert!(shutdown.shutdown());
    let err = call.await?.unwrap_err();
    assert!(err.is_aborted_on_shutdown());
    tokio::time::timeout(Duration::from_secs(5), shutdown.stopped()).await?;

    // the server side of the connection is gone
    let err = conn.unary("sleep", 1).await.unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    Ok(())
}

#[tokio::test]
async fn tcp_connection_close() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let grace = Duration::from_millis(200);
    let (addr, shutdown) = serve_tcp(Probe::default().router(), TcpConfig::default(), grace).await?;
    let conn = TcpConnection::<ProbeService>::open(addr, ConnectOptions::default()).await?;
    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.unary("sleep", 10_000).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.active_exchanges() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    assert!(conn.close(grace).await);
    assert!(!conn.close(grace).await);
    let err = call.await?.unwrap_err();
    assert_eq!(err.code, Code::Aborted);
    let err = conn.unary("sleep", 1).await.unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    // the handler sees the connection go away
    settled(&shutdown).await?;
    Ok(())
}
