//! Network-related utilities (listener setup, TCP tuning)

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking listener with `SO_REUSEADDR`, so a stopped proxy can
/// rebind its port right away.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Enable low-latency options on a TCP stream (best-effort).
pub fn configure_tcp_stream(stream: &TcpStream, context: &str) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("[Net] Failed to enable TCP_NODELAY for {}: {}", context, err);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));

    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("[Net] Failed to configure TCP keepalive for {}: {}", context, err);
    }
}
