//! Socket setup helpers.
//!
//! Grounded in `sockutil_get_tcp_passive`, `sockutil_get_tcp_connected_p`
//! and `sockutil_get_udp_socket` from the original `control.c`: a
//! loopback-bound, `SO_REUSEADDR` TCP listener for the client side, a
//! blocking connect to the data node made non-blocking only once
//! established, and a bound UDP socket for sample ingress. All three are
//! handed back as `std::net` types so callers can register them with the
//! reactor via `mio::net::{TcpListener, TcpStream, UdpSocket}::from_std`.

use std::net::{TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::error::CoreError;

/// Opens a non-blocking, `SO_REUSEADDR` TCP listener bound to
/// `127.0.0.1:port`. Mirrors `sockutil_get_tcp_passive(port, 1)`, where
/// the `1` is the reuse-address flag the original always passes for the
/// client listener.
pub fn tcp_passive(port: u16) -> Result<TcpListener, CoreError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    socket.bind(&addr)?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Connects to the data node at `host:port`, matching
/// `sockutil_get_tcp_connected_p`. The connect itself is blocking (the
/// original session refuses to exist without a data node attached, so
/// there is no async-connect state machine to build); the returned
/// stream is switched to non-blocking before being handed to the
/// reactor, matching `evutil_make_socket_nonblocking` being called right
/// after the connect succeeds.
pub fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, CoreError> {
    let stream = TcpStream::connect((host, port))?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Connects to the data node with an overall timeout, used by the
/// session constructor so a down data node fails creation promptly
/// rather than hanging the caller's startup indefinitely.
pub fn tcp_connect_timeout(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, CoreError> {
    use std::net::ToSocketAddrs;
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| CoreError::InvalidArgument(format!("no address for {host}:{port}")))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Binds the non-blocking UDP socket that samples arrive on. Mirrors
/// `sockutil_get_udp_socket`.
pub fn udp_bound(port: u16) -> Result<UdpSocket, CoreError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    socket.bind(&addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn tcp_passive_accepts_a_connection() {
        let listener = tcp_passive(0).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        // The listener is non-blocking; poll accept() until it succeeds.
        let (mut accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        accepted.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn udp_bound_round_trips_a_datagram() {
        let server = udp_bound(0).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"sample", server_addr).unwrap();

        let mut buf = [0u8; 16];
        let (n, _from) = loop {
            match server.recv_from(&mut buf) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("recv_from failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"sample");
    }
}
