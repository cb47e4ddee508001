//! Socket option helpers (spec §6)
//!
//! TCP gets `NODELAY` applied through a raw-descriptor round trip via
//! `socket2`, the same technique the core crate's former `tcp.rs` used;
//! UDP sockets are constructed through `socket2::Socket` directly so
//! `SO_REUSEADDR` and broadcast can be set before `compio` ever sees the
//! file descriptor.

#![allow(unsafe_code)]

use std::io;
use std::net::SocketAddr;

/// Enable `TCP_NODELAY` on a `compio` TCP stream for minimal latency.
pub fn apply_recommended_stream_opts(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock);
        Ok(())
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock);
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        Ok(())
    }
}

/// Shut down one or both directions of a connected TCP stream. `shutdown(2)`
/// is a plain synchronous syscall, so this goes through the same
/// raw-descriptor round trip as [`apply_recommended_stream_opts`] rather
/// than `compio`'s `AsyncWrite::shutdown` (which only closes both
/// directions at once, matching the `poll_shutdown` contract it mirrors).
pub fn shutdown_stream(
    stream: &compio::net::TcpStream,
    how: std::net::Shutdown,
) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let result = sock.shutdown(how);
        std::mem::forget(sock);
        result
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let result = sock.shutdown(how);
        std::mem::forget(sock);
        result
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = how;
        Ok(())
    }
}

/// Duplicate a connected TCP stream's underlying descriptor so the
/// receive-loop and send-loop can each own an independent handle to the
/// same socket, the same raw-descriptor round trip `apply_recommended_stream_opts`
/// uses, but via `try_clone` instead of an option setter.
pub fn duplicate_stream(stream: &compio::net::TcpStream) -> io::Result<compio::net::TcpStream> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let dup = sock.try_clone();
        std::mem::forget(sock);
        let std_stream: std::net::TcpStream = dup?.into();
        std_stream.set_nonblocking(true)?;
        compio::net::TcpStream::from_std(std_stream)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let dup = sock.try_clone();
        std::mem::forget(sock);
        let std_stream: std::net::TcpStream = dup?.into();
        std_stream.set_nonblocking(true)?;
        compio::net::TcpStream::from_std(std_stream)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "duplicating a TCP stream is not supported on this platform",
        ))
    }
}

/// Default listen backlog (spec §6 "Max listen backlog: 20 unless
/// configured").
pub const DEFAULT_LISTEN_BACKLOG: i32 = 20;

/// Build a listening TCP socket bound to `addr` with an explicit
/// `backlog`, going through `socket2` the same way [`bind_udp_socket`]
/// does, since `compio`'s own `TcpListener::bind` does not expose the
/// backlog argument.
pub fn bind_tcp_listener(addr: SocketAddr, backlog: i32) -> io::Result<compio::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    compio::net::TcpListener::from_std(std_listener)
}

/// Build a UDP socket bound to `addr` with `SO_REUSEADDR` (both the IPv4
/// and IPv6 levels, per spec §6) and broadcast enabled, then hand it to
/// `compio`'s reactor.
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<compio::net::UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).ok();
    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    compio::net::UdpSocket::from_std(std_socket)
}
