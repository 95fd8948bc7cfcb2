//! Construction of plain, blocking sockets.
//!
//! These helpers intentionally skip the non-blocking / readiness-polling dance: the daemon
//! drives every socket from a dedicated OS thread and is happy to block in `recvfrom`/`accept`.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};

/// Binds a UDP socket to `addr`, ready for blocking `recv_from`/`send_to`.
///
/// Dual-stack sockets are not requested: an IPv6 `addr` binds `IPV6_V6ONLY`.
pub fn udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock_addr = socket2::SockAddr::from(addr);
    let socket = socket2::Socket::new(sock_addr.domain(), socket2::Type::DGRAM, None)?;

    if sock_addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.bind(&sock_addr)?;

    Ok(socket.into())
}

/// Binds a TCP listener to `addr` for the control channel.
pub fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let sock_addr = socket2::SockAddr::from(addr);
    let socket = socket2::Socket::new(sock_addr.domain(), socket2::Type::STREAM, None)?;

    if sock_addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.set_reuse_address(true)?;
    socket.bind(&sock_addr)?;
    socket.listen(128)?;

    Ok(socket.into())
}
