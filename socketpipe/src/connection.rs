//! StreamConnection (C5): binds a byte-stream socket to two pipes via a
//! receive-loop and a send-loop (spec §4.5).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use socketpipe_core::error::{Error, Result};
use socketpipe_core::pipe::{pipe, PipeOptions, PipeReader, PipeWriter};
use socketpipe_core::scheduler::Scheduler;
use socketpipe_core::shutdown::{ShutdownKind, ShutdownState};

use crate::socket_options::{apply_recommended_stream_opts, duplicate_stream, shutdown_stream};

/// Configuration for a [`StreamConnection`], modeled on the teacher's
/// `SocketOptions` builder.
#[derive(Clone)]
pub struct StreamConnectionOptions {
    pub block_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub receive_scheduler: Scheduler,
    pub send_scheduler: Scheduler,
    /// Post a zero-byte receive before each real receive when the socket
    /// has nothing buffered. A documented no-op where the platform has
    /// no such semantic (spec §9 "Zero-length reads").
    pub zero_length_reads: bool,
}

impl Default for StreamConnectionOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            high_watermark: 0,
            low_watermark: 0,
            receive_scheduler: Scheduler::default(),
            send_scheduler: Scheduler::default(),
            zero_length_reads: false,
        }
    }
}

impl StreamConnectionOptions {
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    #[must_use]
    pub fn with_zero_length_reads(mut self, enabled: bool) -> Self {
        self.zero_length_reads = enabled;
        self
    }

    fn pipe_options(&self, scheduler: Scheduler) -> PipeOptions {
        PipeOptions::default()
            .with_block_size(self.block_size)
            .with_watermarks(self.low_watermark, self.high_watermark)
            .with_writer_scheduler(scheduler.clone())
            .with_reader_scheduler(scheduler)
    }
}

struct Inner {
    stream: Mutex<Option<TcpStream>>,
    receive_stream: Mutex<Option<TcpStream>>,
    send_stream: Mutex<Option<TcpStream>>,
    receive_pipe_writer: PipeWriter,
    receive_pipe_reader: PipeReader,
    send_pipe_writer: PipeWriter,
    send_pipe_reader: PipeReader,
    shutdown: ShutdownState,
    receive_started: AtomicBool,
    send_started: AtomicBool,
    disposed: AtomicBool,
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    options: StreamConnectionOptions,
    peer_addr: Option<SocketAddr>,
}

/// Owns one TCP socket plus the two pipes bound to it: `receive_pipe`
/// (socket → application) and `send_pipe` (application → socket). Both
/// loops start lazily on first access to their corresponding pipe end
/// (spec §9 "Lazy loop start").
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl StreamConnection {
    /// Wrap an already-connected TCP stream. Applies `NODELAY`.
    pub fn new(stream: TcpStream, options: StreamConnectionOptions) -> io::Result<Self> {
        apply_recommended_stream_opts(&stream)?;
        let peer_addr = stream.peer_addr().ok();
        let receive_stream = duplicate_stream(&stream)?;
        let send_stream = duplicate_stream(&stream)?;

        let (receive_pipe_writer, receive_pipe_reader) =
            pipe(options.pipe_options(options.receive_scheduler.clone()))
                .map_err(pipe_err_to_io)?;
        let (send_pipe_writer, send_pipe_reader) =
            pipe(options.pipe_options(options.send_scheduler.clone())).map_err(pipe_err_to_io)?;

        Ok(Self {
            inner: Arc::new(Inner {
                stream: Mutex::new(Some(stream)),
                receive_stream: Mutex::new(Some(receive_stream)),
                send_stream: Mutex::new(Some(send_stream)),
                receive_pipe_writer,
                receive_pipe_reader,
                send_pipe_writer,
                send_pipe_reader,
                shutdown: ShutdownState::new(),
                receive_started: AtomicBool::new(false),
                send_started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                bytes_read: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                options,
                peer_addr,
            }),
        })
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    #[must_use]
    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.inner.shutdown
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// The reader half of `receive_pipe`. Starts the receive-loop on
    /// first call.
    pub fn receive_reader(&self) -> &PipeReader {
        self.ensure_receive_loop();
        &self.inner.receive_pipe_reader
    }

    /// The writer half of `send_pipe`. Starts the send-loop on first
    /// call.
    pub fn send_writer(&self) -> &PipeWriter {
        self.ensure_send_loop();
        &self.inner.send_pipe_writer
    }

    fn ensure_receive_loop(&self) {
        if self
            .inner
            .receive_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let stream = inner
                .receive_stream
                .lock()
                .take()
                .expect("receive loop starts exactly once");
            compio::runtime::spawn(receive_loop(inner, stream)).detach();
        }
    }

    fn ensure_send_loop(&self) {
        if self
            .inner
            .send_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let stream = inner
                .send_stream
                .lock()
                .take()
                .expect("send loop starts exactly once");
            compio::runtime::spawn(send_loop(inner, stream)).detach();
        }
    }

    /// Close the socket; both loops observe this and exit via the error
    /// policy in §4.5.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        if let Some(stream) = self.inner.stream.lock().take() {
            let _ = shutdown_stream(&stream, std::net::Shutdown::Both);
        }
    }
}

fn pipe_err_to_io(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

async fn receive_loop(inner: Arc<Inner>, mut stream: TcpStream) {
    debug!("receive-loop starting");
    // `zero_length_reads` has no effect here: compio's completion-based
    // reactor gives no way to peek "bytes available" without consuming
    // them, so there is nothing to post (spec §9 sanctions a no-op on
    // platforms lacking the semantic).
    loop {
        let mem = match inner.receive_pipe_writer.get_memory(0) {
            Ok(mem) => mem,
            Err(e) => {
                warn!(error = %e, "receive-loop: get_memory failed");
                inner.receive_pipe_writer.complete(Some(e));
                break;
            }
        };

        let BufResult(result, mem) = stream.read(mem).await;
        match result {
            Ok(0) => {
                inner.shutdown.set(ShutdownKind::ReadEof);
                inner.receive_pipe_writer.complete(None);
                break;
            }
            Ok(n) => {
                if let Err(e) = inner.receive_pipe_writer.advance(&mem, n) {
                    warn!(error = %e, "receive-loop: advance failed");
                    inner.receive_pipe_writer.complete(Some(e));
                    break;
                }
                inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                match inner.receive_pipe_writer.flush_async().await {
                    Ok(flush) if flush.is_completed => {
                        inner.shutdown.set(ShutdownKind::ReadFlushCompleted);
                        inner.receive_pipe_writer.complete(None);
                        break;
                    }
                    Ok(flush) if flush.is_canceled => {
                        inner.shutdown.set(ShutdownKind::ReadFlushCanceled);
                        inner.receive_pipe_writer.complete(None);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "receive-loop: flush failed");
                        inner.receive_pipe_writer.complete(Some(e));
                        break;
                    }
                }
            }
            Err(e) => {
                classify_and_complete_receive(&inner, e);
                break;
            }
        }
    }

    let _ = shutdown_stream(&stream, std::net::Shutdown::Read);
    debug!("receive-loop exited");
}

fn classify_and_complete_receive(inner: &Inner, err: io::Error) {
    let disposed = inner.disposed.load(Ordering::Acquire);
    if disposed {
        inner.shutdown.set(ShutdownKind::ReadDisposed);
        inner.receive_pipe_writer.complete(None);
        return;
    }
    let mapped = Error::from_socket_error(err, false);
    let code = raw_os_error(&mapped);
    let kind = match &mapped {
        Error::ConnectionReset | Error::ConnectionAborted => ShutdownKind::ReadSocketError,
        Error::Io(_) => ShutdownKind::ReadIoError,
        _ => ShutdownKind::ReadOtherError,
    };
    match code {
        Some(code) => {
            inner.shutdown.set_with_error_code(kind, code);
        }
        None => {
            inner.shutdown.set(kind);
        }
    }
    inner.receive_pipe_writer.complete(Some(mapped));
}

fn raw_os_error(err: &Error) -> Option<i32> {
    match err {
        Error::Io(e) => e.raw_os_error(),
        _ => None,
    }
}

async fn send_loop(inner: Arc<Inner>, mut stream: TcpStream) {
    debug!("send-loop starting");
    loop {
        let result = match inner.send_pipe_reader.try_read() {
            Some(r) => r,
            None => match inner.send_pipe_reader.read_async().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "send-loop: read_async failed");
                    break;
                }
            },
        };

        if result.is_canceled {
            break;
        }
        if result.sequence.is_empty() && result.is_completed {
            break;
        }

        if !result.sequence.is_empty() {
            let chunks = result.sequence.chunks();
            match send_chunks(&mut stream, chunks).await {
                Ok(n) => {
                    inner.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    classify_and_complete_send(&inner, e);
                    let _ = shutdown_stream(&stream, std::net::Shutdown::Write);
                    debug!("send-loop exited");
                    return;
                }
            }
        }

        if let Err(e) = inner
            .send_pipe_reader
            .advance_to(result.sequence.end(), None)
        {
            warn!(error = %e, "send-loop: advance_to failed");
            break;
        }
    }

    // Normal (non-error) exit: seal both pipe ends so a subsequent
    // application write/read observes completion rather than hanging.
    inner.send_pipe_writer.complete(None);
    inner.send_pipe_reader.complete(None);
    let _ = shutdown_stream(&stream, std::net::Shutdown::Write);
    debug!("send-loop exited");
}

async fn send_chunks(stream: &mut TcpStream, chunks: Vec<bytes::Bytes>) -> io::Result<usize> {
    if chunks.len() <= 1 {
        let buf = chunks.into_iter().next().unwrap_or_default();
        let BufResult(res, _) = stream.write_all(buf).await;
        res
    } else {
        // Scatter-gather (spec S6): `write_vectored` is a single syscall
        // attempt and may come back short, the same as a plain `write`.
        // Keep reissuing it against whatever of the sequence is left
        // until every byte lands, mirroring the `write_all` guarantee
        // the single-segment branch above gets for free.
        write_vectored_all(stream, chunks).await
    }
}

/// Drive `write_vectored` to completion across a list of segments,
/// trimming already-sent bytes from the front (including a partially
/// sent chunk) before reissuing, since a short vectored write can land
/// mid-chunk.
async fn write_vectored_all(
    stream: &mut TcpStream,
    mut chunks: Vec<bytes::Bytes>,
) -> io::Result<usize> {
    let total: usize = chunks.iter().map(bytes::Bytes::len).sum();
    let mut sent = 0usize;
    while sent < total {
        let BufResult(res, returned) = stream.write_vectored(chunks).await;
        let n = res?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_vectored wrote 0 bytes with data remaining",
            ));
        }
        sent += n;
        chunks = returned;
        advance_chunks(&mut chunks, n);
    }
    Ok(sent)
}

/// Drop `n` bytes from the front of `chunks`, trimming a partially
/// consumed chunk in place via `bytes::Buf::advance` instead of
/// discarding it outright.
fn advance_chunks(chunks: &mut Vec<bytes::Bytes>, mut n: usize) {
    use bytes::Buf;
    while n > 0 {
        let Some(front) = chunks.first_mut() else {
            break;
        };
        let len = front.len();
        if n < len {
            front.advance(n);
            break;
        }
        n -= len;
        chunks.remove(0);
    }
}

fn classify_and_complete_send(inner: &Inner, err: io::Error) {
    let disposed = inner.disposed.load(Ordering::Acquire);
    if disposed {
        inner.shutdown.set(ShutdownKind::WriteDisposed);
        inner.send_pipe_reader.complete(None);
        inner.send_pipe_writer.complete(None);
        return;
    }
    let mapped = Error::from_socket_error(err, false);
    let code = raw_os_error(&mapped);
    let kind = match &mapped {
        Error::ConnectionReset | Error::ConnectionAborted => ShutdownKind::WriteSocketError,
        Error::Io(_) => ShutdownKind::WriteIoError,
        _ => ShutdownKind::WriteOtherError,
    };
    match code {
        Some(code) => {
            inner.shutdown.set_with_error_code(kind, code);
        }
        None => {
            inner.shutdown.set(kind);
        }
    }
    inner.send_pipe_reader.complete(Some(mapped.clone()));
    inner.send_pipe_writer.complete(Some(mapped));
}
