//! Address resolution and listening sockets.

use nix::sys::socket::{
    bind as bind_socket, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, SockaddrStorage,
};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;

use crate::types::{Error, Result};

/// Resolve a configured address to the first socket address it names.
///
/// Accepts `host:port`, `[v6]:port`, and `*:port` or `:port` for every IPv4
/// interface.
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix("*:").or_else(|| addr.strip_prefix(':')) {
        let port: u16 = port
            .parse()
            .map_err(|_| Error::config(format!("bad port in address [{}]", addr)))?;
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    addr.to_socket_addrs()
        .map_err(|e| Error::config(format!("cannot resolve [{}]: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::config(format!("[{}] resolves to no address", addr)))
}

/// Bind a TCP listener with `SO_REUSEADDR` and the given backlog.
pub fn bind(addr: &str, backlog: i32) -> Result<TcpListener> {
    let sa = resolve(addr)?;
    let family = match sa {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(|e| Error::resource(format!("socket for {}: {}", sa, e)))?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind_socket(fd.as_raw_fd(), &SockaddrStorage::from(sa))
        .map_err(|e| Error::resource(format!("bind {}: {}", sa, e)))?;
    listen(&fd, Backlog::new(backlog)?)
        .map_err(|e| Error::resource(format!("listen {}: {}", sa, e)))?;

    Ok(TcpListener::from(fd))
}

/// Put an accepted connection in serving shape: blocking, `TCP_NODELAY`.
pub fn prepare_connection(stream: &TcpStream) -> Result<()> {
    stream
        .set_nonblocking(false)
        .map_err(|e| Error::resource(format!("clearing O_NONBLOCK: {}", e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| Error::resource(format!("setting TCP_NODELAY: {}", e)))
}
