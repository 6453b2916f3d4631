//! mio-based event loop binding.
//!
//! Grounded in `neutronium::net::endpoint::Endpoint`'s `sync(now)` method,
//! which polls a `mio::Poll` and dispatches readiness to its listener,
//! handshake and live connection sets on every tick; this crate's reactor
//! is the same idea shrunk to the session's fixed slot set (one listener,
//! one client stream, one data-node stream, one datagram socket) rather
//! than `neutronium`'s pooled channel table.
//!
//! Accept is asynchronous: the listener token fires on readable and the
//! owner calls `TcpListener::accept()` in a loop until it sees
//! `WouldBlock`, exactly the "async accept" contract. Stream sockets are
//! registered for both readable and writable interest: a write that can't
//! go out whole queues its remainder in the session's per-side output
//! buffer (see `SessionState::flush_stream` in `session.rs`), and the next
//! writable event drains as much of that queue as the kernel has room
//! for, the same job `bufferevent_write` does in the original. The
//! datagram socket is registered once and left registered for the life of
//! the session, mirroring libevent's persistent (`EV_PERSIST`) read event
//! on `control_sample`.

use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::error::CoreError;

/// Token assignments for the session's fixed slot set. Connections
/// accepted off the listener always reuse `CLIENT_STREAM`; the session
/// enforces single-client-at-a-time (see the `attach` function in
/// `session.rs`) so there's never a need for a per-connection token pool.
pub const CLIENT_LISTENER: Token = Token(0);
pub const CLIENT_STREAM: Token = Token(1);
pub const DNODE_STREAM: Token = Token(2);
pub const SAMPLE_DATAGRAM: Token = Token(3);

/// Owns the `mio::Poll` and the `mio::Events` buffer the session drains
/// each tick.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(16),
        })
    }

    pub fn register_listener(&self, source: &mut mio::net::TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, CLIENT_LISTENER, Interest::READABLE)
    }

    pub fn register_stream(&self, source: &mut mio::net::TcpStream, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, token, Interest::READABLE.add(Interest::WRITABLE))
    }

    pub fn deregister_stream(&self, source: &mut mio::net::TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn register_datagram(&self, source: &mut mio::net::UdpSocket) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, SAMPLE_DATAGRAM, Interest::READABLE)
    }

    /// Blocks up to `timeout` waiting for readiness, then hands the
    /// caller the resulting event batch to dispatch. `None` blocks
    /// indefinitely, matching a plain `event_base_loop`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<&Events, CoreError> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(&self.events)
    }
}
