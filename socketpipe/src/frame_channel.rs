//! FrameChannel (C6): binds a datagram socket to two bounded message
//! queues via marshalled send/receive loops (spec §4.6).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_lock::Semaphore;
use compio::buf::BufResult;
use compio::net::UdpSocket;
use tracing::warn;

use socketpipe_core::error::Error;
use socketpipe_core::shutdown::{ShutdownKind, ShutdownState};

use crate::frame::{Frame, Marshaller};

/// Whether a channel binds to a single connected peer or serves many.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Every send targets `connect`'s peer unless overridden per-frame;
    /// deserialize tasks run one at a time to preserve wire order.
    Client,
    /// Every send needs an explicit destination; deserialize tasks run
    /// concurrently (spec §4.6 step 6).
    Server,
}

/// Configuration for a [`FrameChannel`] (spec §4.6 parameters).
#[derive(Clone)]
pub struct FrameChannelOptions {
    pub max_frame_size: usize,
    pub queue_capacity: usize,
    pub mode: ChannelMode,
    /// Fixed destination for `Client`-mode sends with no per-frame
    /// override.
    pub default_peer: Option<SocketAddr>,
}

impl Default for FrameChannelOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 65535,
            queue_capacity: 1024,
            mode: ChannelMode::Server,
            default_peer: None,
        }
    }
}

impl FrameChannelOptions {
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn client(mut self, default_peer: SocketAddr) -> Self {
        self.mode = ChannelMode::Client;
        self.default_peer = Some(default_peer);
        self
    }

    #[must_use]
    pub fn server(mut self) -> Self {
        self.mode = ChannelMode::Server;
        self
    }
}

struct Inner<M: Marshaller> {
    socket: UdpSocket,
    marshaller: M,
    options: FrameChannelOptions,
    shutdown: ShutdownState,
    local_index: AtomicU64,
    disposed: AtomicBool,
    loops_started: AtomicBool,
    /// Caps concurrent in-flight server-mode deserialize tasks at the
    /// inbound queue capacity, per spec §9's open question: unbounded
    /// fire-and-forget deserializes under a full inbound channel would
    /// let the in-flight set grow without limit.
    deserialize_permits: Arc<Semaphore>,
}

/// The application-facing sender half: enqueue frames to be marshalled
/// and sent by the internal send-loop.
pub struct FrameChannelSender<M: Marshaller> {
    outbound_tx: flume::Sender<Frame<M::Payload>>,
    inner: Arc<Inner<M>>,
}

/// The application-facing receiver half: dequeue frames deserialized by
/// the internal receive-loop.
pub struct FrameChannelReceiver<M: Marshaller> {
    inbound_rx: flume::Receiver<Frame<M::Payload>>,
    inner: Arc<Inner<M>>,
}

/// Bind a `FrameChannel` over an already-constructed UDP socket (see
/// `socket_options::bind_udp_socket` for server sockets, or
/// `compio::net::UdpSocket::connect` for clients).
pub fn frame_channel<M: Marshaller>(
    socket: UdpSocket,
    marshaller: M,
    options: FrameChannelOptions,
) -> (FrameChannelSender<M>, FrameChannelReceiver<M>) {
    let (outbound_tx, outbound_rx) = flume::bounded(options.queue_capacity);
    let (inbound_tx, inbound_rx) = flume::bounded(options.queue_capacity);

    let deserialize_permits = Arc::new(Semaphore::new(options.queue_capacity.max(1)));
    let inner = Arc::new(Inner {
        socket,
        marshaller,
        options,
        shutdown: ShutdownState::new(),
        local_index: AtomicU64::new(0),
        disposed: AtomicBool::new(false),
        loops_started: AtomicBool::new(false),
        deserialize_permits,
    });

    start_loops(Arc::clone(&inner), outbound_rx, inbound_tx);

    (
        FrameChannelSender {
            outbound_tx,
            inner: Arc::clone(&inner),
        },
        FrameChannelReceiver { inbound_rx, inner },
    )
}

fn start_loops<M: Marshaller>(
    inner: Arc<Inner<M>>,
    outbound_rx: flume::Receiver<Frame<M::Payload>>,
    inbound_tx: flume::Sender<Frame<M::Payload>>,
) {
    if inner
        .loops_started
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let send_inner = Arc::clone(&inner);
    compio::runtime::spawn(send_loop(send_inner, outbound_rx)).detach();
    compio::runtime::spawn(receive_loop(inner, inbound_tx)).detach();
}

impl<M: Marshaller> FrameChannelSender<M> {
    /// Enqueue a payload for the default peer (client mode) or the
    /// channel's last-received peer (server mode convenience).
    pub async fn send(&self, payload: M::Payload) -> Result<(), Error> {
        self.send_to(payload, self.inner.options.default_peer).await
    }

    /// Enqueue a payload for an explicit destination, waiting if the
    /// outbound queue is full ("wait" full-mode, spec §4.6).
    pub async fn send_to(
        &self,
        payload: M::Payload,
        peer: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let frame = Frame {
            payload,
            local_index: 0,
            peer,
            flags: 0,
        };
        self.outbound_tx
            .send_async(frame)
            .await
            .map_err(|_| Error::invalid_operation("frame channel send-loop is gone"))
    }

    #[must_use]
    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.inner.shutdown
    }

    /// Mark the channel disposed: a subsequent send/receive socket error
    /// is classified as `*Disposed` rather than a live socket error
    /// (spec §4.6/§4.7). UDP has no shutdown handshake to wake a pending
    /// receive, so the loops only observe this on their next I/O error.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }
}

impl<M: Marshaller> FrameChannelReceiver<M> {
    /// Await the next deserialized inbound frame.
    pub async fn recv(&self) -> Option<Frame<M::Payload>> {
        self.inbound_rx.recv_async().await.ok()
    }

    #[must_use]
    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.inner.shutdown
    }
}

async fn send_loop<M: Marshaller>(
    inner: Arc<Inner<M>>,
    outbound_rx: flume::Receiver<Frame<M::Payload>>,
) {
    let mut write_buf = vec![0u8; inner.options.max_frame_size];
    loop {
        let frame = match outbound_rx.recv_async().await {
            Ok(frame) => frame,
            Err(_) => break,
        };

        let committed = match inner.marshaller.write(&frame.payload, &mut write_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "frame-channel send-loop: marshaller.write failed");
                continue;
            }
        };
        if committed == 0 {
            continue;
        }

        let destination = frame.peer.or(inner.options.default_peer);
        let datagram = write_buf[..committed].to_vec();
        let result = match destination {
            Some(addr) => {
                let BufResult(res, _) = inner.socket.send_to(datagram, addr).await;
                res
            }
            None => {
                let BufResult(res, _) = inner.socket.send(datagram).await;
                res
            }
        };

        if let Err(e) = result {
            let mapped = Error::from_socket_error(e, inner.disposed.load(Ordering::Acquire));
            if inner.options.mode == ChannelMode::Server && mapped.is_ignorable_server_send_error()
            {
                continue;
            }
            classify_and_complete(&inner, mapped, ShutdownKind::WriteSocketError, ShutdownKind::WriteIoError);
            break;
        }
    }
}

async fn receive_loop<M: Marshaller>(inner: Arc<Inner<M>>, inbound_tx: flume::Sender<Frame<M::Payload>>) {
    let mut previous_task = None;
    loop {
        let buf = vec![0u8; inner.options.max_frame_size];
        let (result, datagram, peer) = match inner.options.mode {
            ChannelMode::Server => {
                let BufResult(res, buf) = inner.socket.recv_from(buf).await;
                match res {
                    Ok((n, addr)) => (Ok(n), buf, Some(addr)),
                    Err(e) => (Err(e), buf, None),
                }
            }
            ChannelMode::Client => {
                let BufResult(res, buf) = inner.socket.recv(buf).await;
                (res, buf, inner.options.default_peer)
            }
        };

        let n = match result {
            Ok(0) => {
                inner.shutdown.set(ShutdownKind::ReadEof);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                let mapped = Error::from_socket_error(e, inner.disposed.load(Ordering::Acquire));
                classify_and_complete(&inner, mapped, ShutdownKind::ReadSocketError, ShutdownKind::ReadIoError);
                break;
            }
        };

        let index = inner.local_index.fetch_add(1, Ordering::Relaxed);
        let bytes = datagram[..n].to_vec();
        let deserialize_inner = Arc::clone(&inner);
        let deserialize_tx = inbound_tx.clone();

        match inner.options.mode {
            ChannelMode::Server => {
                // Bound the number of concurrently in-flight deserialize
                // tasks to the inbound queue's capacity rather than
                // replicate the source's unbounded fire-and-forget set
                // (spec §9 open question).
                let permit = Arc::clone(&inner.deserialize_permits)
                    .acquire_arc()
                    .await;
                compio::runtime::spawn(async move {
                    let _permit = permit;
                    deserialize_and_enqueue(&deserialize_inner, &deserialize_tx, &bytes, index, peer)
                        .await;
                })
                .detach();
            }
            ChannelMode::Client => {
                let task = compio::runtime::spawn(async move {
                    deserialize_and_enqueue(&deserialize_inner, &deserialize_tx, &bytes, index, peer)
                        .await;
                });
                if let Some(previous) = previous_task.take() {
                    previous.await;
                }
                previous_task = Some(task);
            }
        }
    }
    if let Some(previous) = previous_task {
        previous.await;
    }
}

/// Decode one datagram's bytes and enqueue the resulting frame. Silently
/// exits if the inbound channel is gone (spec §7 "channel full on inbound
/// + shutdown: the receive deserialize-task silently exits").
async fn deserialize_and_enqueue<M: Marshaller>(
    inner: &Inner<M>,
    inbound_tx: &flume::Sender<Frame<M::Payload>>,
    bytes: &[u8],
    index: u64,
    peer: Option<SocketAddr>,
) {
    match inner.marshaller.read(bytes) {
        Ok(payload) => {
            let frame = Frame {
                payload,
                local_index: index,
                peer,
                flags: 0,
            };
            let _ = inbound_tx.send_async(frame).await;
        }
        Err(e) => {
            inner.shutdown.set(ShutdownKind::ReadOtherError);
            warn!(error = %e, "frame-channel receive-loop: marshaller.read failed");
        }
    }
}

fn classify_and_complete<M: Marshaller>(
    inner: &Inner<M>,
    mapped: Error,
    socket_kind: ShutdownKind,
    io_kind: ShutdownKind,
) {
    if inner.disposed.load(Ordering::Acquire) {
        let disposed_kind = match io_kind {
            ShutdownKind::ReadIoError => ShutdownKind::ReadDisposed,
            _ => ShutdownKind::WriteDisposed,
        };
        inner.shutdown.set(disposed_kind);
        return;
    }
    let kind = match &mapped {
        Error::ConnectionReset | Error::ConnectionAborted => socket_kind,
        Error::Io(_) => io_kind,
        _ => io_kind,
    };
    let code = match &mapped {
        Error::Io(e) => e.raw_os_error(),
        _ => None,
    };
    match code {
        Some(code) => {
            inner.shutdown.set_with_error_code(kind, code);
        }
        None => {
            inner.shutdown.set(kind);
        }
    }
}

impl<M: Marshaller> Clone for FrameChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            outbound_tx: self.outbound_tx.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}
