//! Greeter server
//!
//! Serves the greeter routes on a tcp port until the process is asked to
//! terminate. Usage: `greeter-server [listen address]`
use std::net::SocketAddr;

use anyhow::Context;
use pattern_rpc::{
    greeter::{Greeter, GreeterService, DEFAULT_PORT},
    server::TcpServiceListener,
    transport::tcp::{TcpConfig, TcpListener},
    RpcServer, ShutdownHandle,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let addr: SocketAddr = match std::env::args().nth(1) {
        Some(addr) => addr.parse().context("invalid listen address")?,
        None => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
    };
    let listener: TcpServiceListener<GreeterService> = TcpListener::bind(addr, TcpConfig::default())
        .await
        .with_context(|| format!("unable to listen on {addr}"))?;
    let server = RpcServer::new(listener, Greeter::default().router());
    println!("Server started listening in {}", addr.port());
    tokio::spawn(shutdown_on_signal(server.shutdown_handle()));
    server.run().await.context("server failed")?;
    println!("*** server shut down");
    Ok(())
}

/// Start the orderly shutdown once the process is asked to terminate
async fn shutdown_on_signal(handle: ShutdownHandle) {
    if let Err(cause) = terminate().await {
        warn!(%cause, "unable to listen for termination signals");
        return;
    }
    if handle.shutdown() {
        println!("*** shutting down server since the process is terminating");
    }
}

#[cfg(unix)]
async fn terminate() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn terminate() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
