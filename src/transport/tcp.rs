//! Multiplexed tcp transport
//!
//! A single tcp stream carries any number of concurrent exchanges. Frames are
//! length delimited and postcard encoded. Every frame names the exchange it
//! belongs to:
//!
//! - `Open` starts an exchange. Only the dialing side opens exchanges.
//! - `Data` carries one postcard encoded item.
//! - `Close` means the sender dropped its send half of the exchange.
//! - `Credit` allows the peer to send more items on an exchange.
//! - `Reset` means the sender dropped its receive half, so the peer should
//!   stop sending.
//!
//! Each direction of an exchange starts with a window of `window` items. The
//! receiver hands out more credit as its consumer drains items, so a slow
//! consumer only ever stalls its own exchange and never the reader of the
//! whole connection.
use std::{
    collections::HashMap,
    fmt, io,
    marker::PhantomData,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_lite::{Future, Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{ready, task::AtomicWaker, SinkExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, ToSocketAddrs,
    },
    runtime::Handle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::{CancellationToken, DropGuard},
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{ConnectionErrors, Connector, Listener, LocalAddr, StreamTypes};
use crate::{lock, RpcMessage};

/// Outbound frames queued per connection before senders have to wait
const DATA_QUEUE: usize = 256;
/// Inbound exchanges waiting for [`Listener::accept`] before new ones are refused
const ACCEPT_BACKLOG: usize = 128;
/// Room for the frame header in front of a payload
const FRAME_OVERHEAD: usize = 32;

/// Configuration of a tcp connection
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum size of a single encoded frame
    pub max_frame_length: usize,
    /// Number of items a peer may send on one exchange before it needs credit
    pub window: u32,
    /// Runtime that runs the reader and writer tasks
    pub runtime: Option<Handle>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_length: 1024 * 1024 * 16,
            window: 32,
            runtime: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Open { id: u64 },
    Data { id: u64, payload: Vec<u8> },
    Close { id: u64 },
    Credit { id: u64, n: u32 },
    Reset { id: u64 },
}

/// Send credit of one direction of one exchange.
#[derive(Debug)]
struct Credit {
    available: AtomicU64,
    closed: AtomicBool,
    waker: AtomicWaker,
}

impl Credit {
    fn new(window: u32) -> Self {
        Self {
            available: AtomicU64::new(window as u64),
            closed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    fn try_take(&self) -> Result<bool, SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Reset);
        }
        Ok(self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok())
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<(), SendError>> {
        if self.try_take()? {
            return Poll::Ready(Ok(()));
        }
        self.waker.register(cx.waker());
        // credit might have arrived between the first check and registering
        if self.try_take()? {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }

    fn grant(&self, n: u32) {
        self.available.fetch_add(n as u64, Ordering::AcqRel);
        self.waker.wake();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.wake();
    }
}

type Inbound<In> = flume::Sender<Result<In, RecvError>>;
type InboundMap<In> = Mutex<HashMap<u64, Inbound<In>>>;

/// State of one tcp connection that does not depend on the item types
#[derive(Debug)]
struct Shared {
    credits: Mutex<HashMap<u64, Arc<Credit>>>,
    data: flume::Sender<Frame>,
    control: flume::Sender<Frame>,
    window: u32,
    max_frame_length: usize,
    handle: Handle,
    closed: AtomicBool,
}

impl Shared {
    fn grant(&self, id: u64, n: u32) {
        if let Some(credit) = lock(&self.credits).get(&id) {
            credit.grant(n);
        }
    }

    fn reset(&self, id: u64) {
        if let Some(credit) = lock(&self.credits).get(&id) {
            credit.close();
        }
    }

    /// The local send half of exchange `id` is gone.
    fn close_send(&self, id: u64) {
        lock(&self.credits).remove(&id);
        match self.data.try_send(Frame::Close { id }) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(frame)) => {
                let data = self.data.clone();
                self.handle.spawn(async move {
                    data.send_async(frame).await.ok();
                });
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Both halves of the per connection state
struct Mux<In> {
    shared: Arc<Shared>,
    inbound: Arc<InboundMap<In>>,
}

impl<In> Clone for Mux<In> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            inbound: self.inbound.clone(),
        }
    }
}

impl<In: RpcMessage> Mux<In> {
    /// Register exchange `id` and create both halves for it
    fn register<Out: RpcMessage>(&self, id: u64) -> Option<Socket<In, Out>> {
        let (tx, rx) = flume::unbounded();
        let credit = Arc::new(Credit::new(self.shared.window));
        {
            // teardown flips `closed` under the same lock
            let mut inbound = lock(&self.inbound);
            if self.shared.is_closed() || inbound.contains_key(&id) {
                return None;
            }
            inbound.insert(id, tx);
            lock(&self.shared.credits).insert(id, credit.clone());
        }
        let send = SendSink {
            id,
            credit,
            reserved: false,
            queue: self.shared.data.clone().into_sink(),
            shared: self.shared.clone(),
            _p: PhantomData,
        };
        let recv = RecvStream {
            id,
            inner: rx.into_stream(),
            inbound: self.inbound.clone(),
            shared: self.shared.clone(),
            consumed: 0,
        };
        Some((send, recv))
    }

    fn deliver(&self, id: u64, payload: &[u8]) {
        let item = postcard::from_bytes::<In>(payload).map_err(|e| RecvError::Decode(e.to_string()));
        match lock(&self.inbound).get(&id) {
            Some(tx) => {
                tx.send(item).ok();
            }
            None => trace!(id, "data for unknown exchange"),
        }
    }

    /// Fail everything that is still open on this connection
    fn teardown(&self) {
        let mut inbound = lock(&self.inbound);
        self.shared.closed.store(true, Ordering::Release);
        for (_, tx) in inbound.drain() {
            tx.send(Err(RecvError::ConnectionLost)).ok();
        }
        for (_, credit) in lock(&self.shared.credits).drain() {
            credit.close();
        }
    }
}

type Socket<In, Out> = (SendSink<Out>, RecvStream<In>);

/// Start the reader and writer tasks of one tcp connection
fn spawn_connection<In: RpcMessage, Out: RpcMessage>(
    stream: TcpStream,
    peer: SocketAddr,
    config: &TcpConfig,
    cancel: CancellationToken,
    accept: Option<flume::Sender<Socket<In, Out>>>,
) -> Mux<In> {
    let handle = config.runtime.clone().unwrap_or_else(Handle::current);
    let (read, write) = stream.into_split();
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_frame_length)
        .new_codec();
    let reader = FramedRead::new(read, codec.clone());
    let writer = FramedWrite::new(write, codec);
    let (data_tx, data_rx) = flume::bounded(DATA_QUEUE);
    let (control_tx, control_rx) = flume::unbounded();
    let mux = Mux {
        shared: Arc::new(Shared {
            credits: Mutex::new(HashMap::new()),
            data: data_tx,
            control: control_tx,
            window: config.window.max(1),
            max_frame_length: config.max_frame_length,
            handle: handle.clone(),
            closed: AtomicBool::new(false),
        }),
        inbound: Arc::new(Mutex::new(HashMap::new())),
    };
    let span = debug_span!("tcp", %peer);
    handle.spawn(write_loop(writer, data_rx, control_rx, cancel.clone()).instrument(span.clone()));
    handle.spawn(read_loop(mux.clone(), reader, accept, cancel).instrument(span));
    mux
}

async fn read_loop<In: RpcMessage, Out: RpcMessage>(
    mux: Mux<In>,
    mut frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    accept: Option<flume::Sender<Socket<In, Out>>>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(cause)) => {
                    debug!(%cause, "read failed");
                    break;
                }
                None => {
                    debug!("peer closed the connection");
                    break;
                }
            },
        };
        let frame = match postcard::from_bytes::<Frame>(&bytes) {
            Ok(frame) => frame,
            Err(cause) => {
                warn!(%cause, "undecodable frame, closing connection");
                break;
            }
        };
        match frame {
            Frame::Open { id } => {
                let Some(accept) = &accept else {
                    warn!(id, "peer tried to open an exchange");
                    continue;
                };
                let Some(socket) = mux.register::<Out>(id) else {
                    warn!(id, "duplicate exchange id");
                    continue;
                };
                match accept.try_send(socket) {
                    Ok(()) => trace!(id, "exchange accepted"),
                    // dropping the socket closes the exchange
                    Err(flume::TrySendError::Full(_)) => warn!(id, "accept backlog full, refusing exchange"),
                    Err(flume::TrySendError::Disconnected(_)) => {
                        debug!("listener dropped");
                        break;
                    }
                }
            }
            Frame::Data { id, payload } => mux.deliver(id, &payload),
            Frame::Close { id } => {
                lock(&mux.inbound).remove(&id);
            }
            Frame::Credit { id, n } => mux.shared.grant(id, n),
            Frame::Reset { id } => mux.shared.reset(id),
        }
    }
    cancel.cancel();
    mux.teardown();
}

async fn write_loop(
    mut frames: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    data: flume::Receiver<Frame>,
    control: flume::Receiver<Frame>,
    cancel: CancellationToken,
) {
    let res: io::Result<()> = async {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Ok(frame) = control.recv_async() => frame,
                Ok(frame) = data.recv_async() => frame,
            };
            write_frame(&mut frames, &frame).await?;
            if data.is_empty() && control.is_empty() {
                SinkExt::<Bytes>::flush(&mut frames).await?;
            }
        }
        // frames that were queued before the cancellation, e.g. closes of dropped exchanges
        while let Ok(frame) = control.try_recv().or_else(|_| data.try_recv()) {
            write_frame(&mut frames, &frame).await?;
        }
        SinkExt::<Bytes>::flush(&mut frames).await?;
        frames.get_mut().shutdown().await
    }
    .await;
    if let Err(cause) = res {
        debug!(%cause, "write failed");
    }
    cancel.cancel();
}

async fn write_frame(
    frames: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    frame: &Frame,
) -> io::Result<()> {
    let bytes = postcard::to_stdvec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    frames.feed(Bytes::from(bytes)).await
}

/// Send half of an exchange on a tcp connection.
///
/// Dropping it closes the exchange in this direction.
pub struct SendSink<Out> {
    id: u64,
    credit: Arc<Credit>,
    reserved: bool,
    queue: flume::r#async::SendSink<'static, Frame>,
    shared: Arc<Shared>,
    _p: PhantomData<fn(Out)>,
}

impl<Out> fmt::Debug for SendSink<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSink").field("id", &self.id).finish()
    }
}

impl<Out: RpcMessage> Sink<Out> for SendSink<Out> {
    type Error = self::SendError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if !this.reserved {
            ready!(this.credit.poll_take(cx))?;
            this.reserved = true;
        }
        this.queue
            .poll_ready_unpin(cx)
            .map_err(|_| SendError::ConnectionLost)
    }

    fn start_send(self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        let this = self.get_mut();
        // credit is taken in poll_ready, one item per credit
        this.reserved = false;
        let payload = postcard::to_stdvec(&item).map_err(|e| SendError::Encode(e.to_string()))?;
        if payload.len() + FRAME_OVERHEAD > this.shared.max_frame_length {
            return Err(SendError::TooLarge(payload.len()));
        }
        this.queue
            .start_send_unpin(Frame::Data { id: this.id, payload })
            .map_err(|_| SendError::ConnectionLost)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut()
            .queue
            .poll_flush_unpin(cx)
            .map_err(|_| SendError::ConnectionLost)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // the queue is shared by all exchanges, closing only happens on drop
        self.poll_flush(cx)
    }
}

impl<Out> Drop for SendSink<Out> {
    fn drop(&mut self) {
        self.shared.close_send(self.id);
    }
}

/// Receive half of an exchange on a tcp connection.
///
/// Dropping it tells the peer to stop sending on this exchange.
pub struct RecvStream<In: 'static> {
    id: u64,
    inner: flume::r#async::RecvStream<'static, Result<In, RecvError>>,
    inbound: Arc<InboundMap<In>>,
    shared: Arc<Shared>,
    consumed: u32,
}

impl<In: 'static> fmt::Debug for RecvStream<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream").field("id", &self.id).finish()
    }
}

impl<In: RpcMessage> Stream for RecvStream<In> {
    type Item = Result<In, RecvError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        if item.is_some() {
            this.consumed += 1;
            if this.consumed >= (this.shared.window / 2).max(1) {
                let frame = Frame::Credit {
                    id: this.id,
                    n: this.consumed,
                };
                this.shared.control.send(frame).ok();
                this.consumed = 0;
            }
        }
        Poll::Ready(item)
    }
}

impl<In: 'static> Drop for RecvStream<In> {
    fn drop(&mut self) {
        lock(&self.inbound).remove(&self.id);
        self.shared.control.send(Frame::Reset { id: self.id }).ok();
    }
}

/// A tcp connector: one tcp stream to a listener, multiplexing all exchanges
/// opened with [`Connector::open`].
pub struct TcpConnector<In, Out> {
    mux: Mux<In>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
    peer: SocketAddr,
    _p: PhantomData<fn(Out)>,
}

impl<In, Out> Clone for TcpConnector<In, Out> {
    fn clone(&self) -> Self {
        Self {
            mux: self.mux.clone(),
            next_id: self.next_id.clone(),
            cancel: self.cancel.clone(),
            _guard: self._guard.clone(),
            peer: self.peer,
            _p: PhantomData,
        }
    }
}

impl<In, Out> fmt::Debug for TcpConnector<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("peer", &self.peer)
            .field("closed", &self.mux.shared.is_closed())
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> TcpConnector<In, Out> {
    /// Dial a [`TcpListener`] and start the connection tasks.
    pub async fn connect(addr: impl ToSocketAddrs, config: TcpConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "connected");
        let cancel = CancellationToken::new();
        let mux = spawn_connection::<In, Out>(stream, peer, &config, cancel.clone(), None);
        Ok(Self {
            mux,
            next_id: Arc::new(AtomicU64::new(0)),
            _guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
            peer,
            _p: PhantomData,
        })
    }

    /// Address of the listener this connector is connected to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for TcpConnector<In, Out> {
    type SendError = self::SendError;
    type RecvError = self::RecvError;
    type OpenError = self::OpenError;
    type AcceptError = self::AcceptError;
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for TcpConnector<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Connector for TcpConnector<In, Out> {
    fn open(&self) -> impl Future<Output = Result<Socket<In, Out>, self::OpenError>> + Send {
        let mux = self.mux.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        async move {
            if mux.shared.is_closed() {
                return Err(OpenError::ConnectionLost);
            }
            let socket = mux.register::<Out>(id).ok_or(OpenError::ConnectionLost)?;
            mux.shared
                .data
                .send_async(Frame::Open { id })
                .await
                .map_err(|_| OpenError::ConnectionLost)?;
            Ok(socket)
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        self.cancel.cancel();
        async {}
    }
}

/// A tcp listener that accepts exchanges from any number of connectors.
///
/// Dropping the last clone stops accepting tcp connections and closes the
/// ones that are established.
pub struct TcpListener<In: 'static, Out> {
    accept: flume::Receiver<Socket<In, Out>>,
    local_addr: [LocalAddr; 1],
    _guard: Arc<DropGuard>,
}

impl<In: 'static, Out> Clone for TcpListener<In, Out> {
    fn clone(&self) -> Self {
        Self {
            accept: self.accept.clone(),
            local_addr: self.local_addr.clone(),
            _guard: self._guard.clone(),
        }
    }
}

impl<In: 'static, Out> fmt::Debug for TcpListener<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> TcpListener<In, Out> {
    /// Bind to `addr` and start accepting tcp connections.
    pub async fn bind(addr: impl ToSocketAddrs, config: TcpConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = flume::bounded(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();
        let handle = config.runtime.clone().unwrap_or_else(Handle::current);
        let span = debug_span!("tcp listener", %local);
        handle.spawn(accept_loop(listener, config, tx, cancel.clone()).instrument(span));
        Ok(Self {
            accept: rx,
            local_addr: [LocalAddr::Socket(local)],
            _guard: Arc::new(cancel.drop_guard()),
        })
    }
}

async fn accept_loop<In: RpcMessage, Out: RpcMessage>(
    listener: tokio::net::TcpListener,
    config: TcpConfig,
    accept: flume::Sender<Socket<In, Out>>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(cause) => {
                    warn!(%cause, "error accepting connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        debug!(%peer, "connection established");
        if let Err(cause) = stream.set_nodelay(true) {
            debug!(%cause, "unable to set nodelay");
        }
        spawn_connection::<In, Out>(stream, peer, &config, cancel.child_token(), Some(accept.clone()));
    }
    debug!("stopped accepting connections");
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for TcpListener<In, Out> {
    type SendError = self::SendError;
    type RecvError = self::RecvError;
    type OpenError = self::OpenError;
    type AcceptError = self::AcceptError;
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for TcpListener<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Listener for TcpListener<In, Out> {
    fn accept(&self) -> impl Future<Output = Result<Socket<In, Out>, self::AcceptError>> + Send {
        let accept = self.accept.clone();
        async move { accept.recv_async().await.map_err(|_| AcceptError::Closed) }
    }

    fn local_addr(&self) -> &[LocalAddr] {
        &self.local_addr
    }
}

/// Error when sending on a tcp exchange
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The tcp connection is gone
    #[error("connection lost")]
    ConnectionLost,
    /// The peer stopped reading this exchange
    #[error("exchange reset by peer")]
    Reset,
    /// The item could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),
    /// The encoded item does not fit into a frame
    #[error("item of {0} bytes exceeds the maximum frame length")]
    TooLarge(usize),
}

/// Error when receiving on a tcp exchange
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The tcp connection is gone
    #[error("connection lost")]
    ConnectionLost,
    /// The item could not be decoded. Only this exchange is affected.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Error when opening a tcp exchange
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The tcp connection is gone
    #[error("connection lost")]
    ConnectionLost,
}

/// Error when accepting a tcp exchange
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener stopped and every connection it accepted is gone
    #[error("listener closed")]
    Closed,
}
