use std::{
    borrow::Cow,
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
};

use anyhow::Context;
use socket2::{Domain, Socket, Type};

/// Exposed ports are only ever bound on loopback.
pub const BIND_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Normalize a broker address.
///
/// The shorthand `":PORT"` means "this host" and becomes `"127.0.0.1:PORT"`.
pub fn normalize_broker_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("{BIND_HOST}{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Normalize a local listen address (the metrics exporter).
///
/// Here `":PORT"` means all interfaces and becomes `"0.0.0.0:PORT"`.
pub fn normalize_listen_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("{}{addr}", Ipv4Addr::UNSPECIFIED))
    } else {
        Cow::Borrowed(addr)
    }
}

pub fn resolve_broker_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = normalize_broker_addr(addr);
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    addr.to_socket_addrs()
        .with_context(|| format!("net: resolve {addr:?}"))?
        .next()
        .with_context(|| format!("net: {addr:?} resolved to no addresses"))
}

/// Non-blocking TCP listener on `127.0.0.1:port` with `SO_REUSEADDR` and `backlog`.
pub fn bind_tcp_listener(port: u16, backlog: i32) -> io::Result<mio::net::TcpListener> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&SocketAddr::from((BIND_HOST, port)).into())?;
    sock.listen(backlog)?;
    sock.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(sock.into()))
}

/// Non-blocking UDP socket on `127.0.0.1:port`.
///
/// No `SO_REUSEADDR`: on Linux it would let two UDP sockets share a port.
pub fn bind_udp_socket(port: u16) -> io::Result<mio::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.bind(&SocketAddr::from((BIND_HOST, port)).into())?;
    sock.set_nonblocking(true)?;
    Ok(mio::net::UdpSocket::from_std(sock.into()))
}
