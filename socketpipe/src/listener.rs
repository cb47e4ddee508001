//! ClientListener (C8): accepts client sockets and wraps each in a
//! `StreamConnection` (spec §4.8).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use compio::net::TcpListener;
use tracing::{error, warn};

use socketpipe_core::error::Error;

use crate::connection::{StreamConnection, StreamConnectionOptions};
use crate::socket_options::{bind_tcp_listener, DEFAULT_LISTEN_BACKLOG};

type ClientTask = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// Configuration for a [`ClientListener`] (spec §6).
#[derive(Clone, Copy)]
pub struct ListenerOptions {
    /// Maximum pending-connection backlog. Default 20.
    pub backlog: i32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl ListenerOptions {
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }
}

/// User hooks for a [`ClientListener`]'s accept loop.
pub trait ClientListenerHandler: Send + Sync + 'static {
    /// Called once per accepted connection. Errors returned by the
    /// returned future complete both pipe ends with that error (spec
    /// §4.8) and are reported via [`Self::on_client_faulted`].
    fn on_client(&self, transport: StreamConnection, remote: SocketAddr) -> ClientTask;

    /// Called when `on_client`'s future resolves with an error.
    fn on_client_faulted(&self, remote: SocketAddr, error: &Error) {
        let _ = (remote, error);
    }

    /// Called when the accept loop itself exits abnormally (anything
    /// other than the listener being disposed).
    fn on_server_faulted(&self, error: &io::Error) {
        let _ = error;
    }
}

/// Binds a listening socket and dispatches each accepted client to a
/// user-provided handler.
pub struct ClientListener {
    listener: TcpListener,
    connection_options: StreamConnectionOptions,
    disposed: Arc<AtomicBool>,
}

impl ClientListener {
    /// Bind with the default listen backlog (spec §6: 20).
    pub async fn bind(
        addr: SocketAddr,
        connection_options: StreamConnectionOptions,
    ) -> io::Result<Self> {
        Self::bind_with_options(addr, ListenerOptions::default(), connection_options).await
    }

    pub async fn bind_with_options(
        addr: SocketAddr,
        listener_options: ListenerOptions,
        connection_options: StreamConnectionOptions,
    ) -> io::Result<Self> {
        let listener = bind_tcp_listener(addr, listener_options.backlog)?;
        Ok(Self {
            listener,
            connection_options,
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Signal the accept loop to stop after its current `accept()` call.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Drive the accept loop until disposed or the listener socket
    /// fails. Each accepted client runs `handler.on_client` concurrently
    /// on its own task.
    pub async fn serve(&self, handler: Arc<dyn ClientListenerHandler>) {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                break;
            }
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let options = self.connection_options.clone();
                    let handler = Arc::clone(&handler);
                    compio::runtime::spawn(handle_client(stream, remote, options, handler))
                        .detach();
                }
                Err(e) => {
                    if self.disposed.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(error = %e, "client listener accept failed");
                    handler.on_server_faulted(&e);
                    break;
                }
            }
        }
    }
}

async fn handle_client(
    stream: compio::net::TcpStream,
    remote: SocketAddr,
    options: StreamConnectionOptions,
    handler: Arc<dyn ClientListenerHandler>,
) {
    let transport = match StreamConnection::new(stream, options) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, %remote, "failed to wrap accepted socket");
            return;
        }
    };

    let result = handler.on_client(transport.clone(), remote).await;
    if let Err(e) = &result {
        transport.send_writer().complete(Some(e.clone()));
        transport.receive_reader().complete(Some(e.clone()));
        handler.on_client_faulted(remote, e);
    }
    transport.dispose();
}
