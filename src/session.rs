//! The control session: C6 from the design, tying together the client
//! listener, the data-node stream, the UDP sample socket, the transaction
//! table and the worker thread.
//!
//! Grounded in `struct control_session` and `control_new`/`control_free`/
//! `control_conn_open`/the bev read and event callbacks in `control.c`.
//! Where the C version unwinds partial construction with a hand-written
//! `goto` ladder, this port leans on Rust's own scoping: locals that are
//! already fully constructed when an early `?` return fires are dropped in
//! declaration order automatically, which is exactly "release resources
//! acquired so far, in reverse order" for everything except the two side
//! handlers' `stop()` hooks (calling a user hook isn't something `Drop`
//! can do on its own, so those are called explicitly on every failure path
//! below, mirroring the `noclient`/`nodnode` labels in `control_new`).

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::{fatal, CoreError};
use crate::handler::{Side, SideHandler, WakeReason};
use crate::reactor::{self, Reactor};
use crate::sockutil;
use crate::txn::TransactionTable;
use crate::worker;

/// The mutable state one mutex protects: the client and data-node stream
/// endpoints (present iff a connection is attached to that side), their
/// pending-byte ingress buffers, the transaction table, and the
/// wake-reason bitset. Matches `cbev`/`dbev`/`ctl_txns`/`ctl_n_txns`/
/// `ctl_cur_txn`/`ctl_cur_rid`/`wake_why` from `struct control_session`.
pub struct SessionState {
    client_stream: Option<TcpStream>,
    dnode_stream: Option<TcpStream>,
    client_inbuf: Vec<u8>,
    dnode_inbuf: Vec<u8>,
    client_outbuf: Vec<u8>,
    dnode_outbuf: Vec<u8>,
    /// The client-side UDP forward endpoint (`cdatafd` in the original),
    /// declared so the shape matches the design, but never wired to
    /// anything. Whether forwarding should be per-connection or
    /// per-session is still an open question. Board samples are always
    /// dropped, never forwarded.
    forward_attached: bool,
    pub txns: TransactionTable,
    wake_why: WakeReason,
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            client_stream: None,
            dnode_stream: None,
            client_inbuf: Vec::new(),
            dnode_inbuf: Vec::new(),
            client_outbuf: Vec::new(),
            dnode_outbuf: Vec::new(),
            forward_attached: false,
            txns: TransactionTable::new(),
            wake_why: WakeReason::empty(),
        }
    }

    fn has_stream(&self, side: Side) -> bool {
        match side {
            Side::Client => self.client_stream.is_some(),
            Side::Dnode => self.dnode_stream.is_some(),
        }
    }

    fn install_stream(&mut self, side: Side, stream: TcpStream) {
        match side {
            Side::Client => self.client_stream = Some(stream),
            Side::Dnode => self.dnode_stream = Some(stream),
        }
    }

    fn stream_mut(&mut self, side: Side) -> Option<&mut TcpStream> {
        match side {
            Side::Client => self.client_stream.as_mut(),
            Side::Dnode => self.dnode_stream.as_mut(),
        }
    }

    fn clear_stream(&mut self, side: Side) {
        match side {
            Side::Client => {
                self.client_stream = None;
                self.client_outbuf.clear();
            }
            Side::Dnode => {
                self.dnode_stream = None;
                self.dnode_outbuf.clear();
            }
        }
    }

    fn inbuf_mut(&mut self, side: Side) -> &mut Vec<u8> {
        match side {
            Side::Client => &mut self.client_inbuf,
            Side::Dnode => &mut self.dnode_inbuf,
        }
    }

    /// Splits the borrow so a caller can read off the stream into its
    /// ingress buffer in one pass, without re-locking or re-borrowing
    /// `self` partway through (the two fields are disjoint, but a pair of
    /// separate `&mut self` accessor calls would conflict).
    fn stream_and_inbuf_mut(&mut self, side: Side) -> (Option<&mut TcpStream>, &mut Vec<u8>) {
        match side {
            Side::Client => (self.client_stream.as_mut(), &mut self.client_inbuf),
            Side::Dnode => (self.dnode_stream.as_mut(), &mut self.dnode_inbuf),
        }
    }

    /// Same split as `stream_and_inbuf_mut`, for the pending-output buffer
    /// a write enqueues into and a writable event drains.
    fn stream_and_outbuf_mut(&mut self, side: Side) -> (Option<&mut TcpStream>, &mut Vec<u8>) {
        match side {
            Side::Client => (self.client_stream.as_mut(), &mut self.client_outbuf),
            Side::Dnode => (self.dnode_stream.as_mut(), &mut self.dnode_outbuf),
        }
    }

    /// Drains as much of `side`'s pending-output buffer as the stream will
    /// currently accept, the `bufferevent_write` half of the socket pipe:
    /// a write that can't go out whole leaves its remainder queued here for
    /// the next writable event to pick up. A no-op if that side has
    /// nothing queued or isn't connected.
    fn flush_stream(&mut self, side: Side) -> io::Result<()> {
        let (stream_opt, outbuf) = self.stream_and_outbuf_mut(side);
        let Some(stream) = stream_opt else {
            return Ok(());
        };
        while !outbuf.is_empty() {
            match stream.write(outbuf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"));
                }
                Ok(n) => {
                    outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes the reactor has drained off the client stream but that no
    /// `read` hook has yet consumed. A handler's `read` implementation
    /// parses complete packets out of the front of this buffer and calls
    /// `Vec::drain` to remove the bytes it used.
    pub fn client_inbuf(&mut self) -> &mut Vec<u8> {
        &mut self.client_inbuf
    }

    pub fn dnode_inbuf(&mut self) -> &mut Vec<u8> {
        &mut self.dnode_inbuf
    }

    pub fn client_connected(&self) -> bool {
        self.client_stream.is_some()
    }

    pub fn dnode_connected(&self) -> bool {
        self.dnode_stream.is_some()
    }

    /// Whether a client-side UDP forward endpoint is attached. Always
    /// `false` today (see the `forward_attached` doc comment); exposed so
    /// a `read`/`thread` hook can decide whether forwarding samples is
    /// worth attempting without reaching into session internals it
    /// shouldn't otherwise see.
    pub fn forward_attached(&self) -> bool {
        self.forward_attached
    }

    /// Queues bytes for the client stream and immediately tries to drain
    /// them, relied upon to be safe from either the reactor thread or the
    /// worker thread ("write operations on stream endpoints are
    /// thread-safe by construction", here that's literal: both threads go
    /// through the same mutex-guarded `Option<TcpStream>`). Whatever the
    /// kernel won't take right away stays in the outbuf for the next
    /// writable event to finish.
    pub fn write_client(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.client_stream.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no client attached"));
        }
        self.client_outbuf.extend_from_slice(bytes);
        self.flush_stream(Side::Client)
    }

    pub fn write_dnode(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.dnode_stream.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no data node attached"));
        }
        self.dnode_outbuf.extend_from_slice(bytes);
        self.flush_stream(Side::Dnode)
    }

    /// Drains whatever is left queued for `side`, called when the reactor
    /// sees that side's stream go writable again.
    pub(crate) fn flush_pending(&mut self, side: Side) -> io::Result<()> {
        self.flush_stream(side)
    }

    /// Asserts the given wake reasons. Mirrors `control_set_wake`, minus
    /// the locking (the caller already holds the session mutex by virtue
    /// of having a `&mut SessionState` at all).
    pub fn wake(&mut self, why: WakeReason) {
        self.wake_why |= why;
    }

    pub fn wake_why(&self) -> WakeReason {
        self.wake_why
    }

    /// A `thread` hook calls this once it has acted on the bits it was
    /// given, per the contract that each hook clears the bits it consumed
    /// before returning.
    pub fn clear_wake(&mut self, bits: WakeReason) {
        self.wake_why.remove(bits);
    }
}

/// State shared between the caller's reactor thread and the worker
/// thread: the session mutex/condvar pair, and the two side handlers
/// (each independently lockable, so the reactor thread can call a `read`/
/// `open`/`close` hook without blocking the worker's `thread` hook on the
/// other side, and vice versa).
pub struct Shared {
    state: Mutex<SessionState>,
    cv: Condvar,
    client_handler: Mutex<Box<dyn SideHandler>>,
    dnode_handler: Mutex<Box<dyn SideHandler>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|_| fatal("session mutex poisoned"))
    }

    pub(crate) fn wait_for_wake<'a>(&'a self, guard: MutexGuard<'a, SessionState>) -> MutexGuard<'a, SessionState> {
        self.cv.wait(guard).unwrap_or_else(|_| fatal("condition variable wait failed"))
    }

    pub(crate) fn notify_worker(&self) {
        self.cv.notify_one();
    }

    fn handler(&self, side: Side) -> &Mutex<Box<dyn SideHandler>> {
        match side {
            Side::Client => &self.client_handler,
            Side::Dnode => &self.dnode_handler,
        }
    }

    pub(crate) fn client_handler(&self) -> &Mutex<Box<dyn SideHandler>> {
        &self.client_handler
    }

    pub(crate) fn dnode_handler(&self) -> &Mutex<Box<dyn SideHandler>> {
        &self.dnode_handler
    }

    pub(crate) fn state(&self) -> &Mutex<SessionState> {
        &self.state
    }
}

/// Attaches `stream` to `side`'s slot, running the connection-open
/// protocol: refuse (close the fd, leave the existing
/// session alone) if that side is already occupied; otherwise install the
/// endpoint disabled, invoke the side's `open` hook, and only register it
/// with the reactor (the Rust stand-in for "enable read and write") once
/// `open` succeeds. Returns whether the connection was accepted.
fn attach(shared: &Arc<Shared>, reactor: &Reactor, side: Side, stream: TcpStream) -> Result<bool, CoreError> {
    {
        let mut state = shared.lock_state();
        if state.has_stream(side) {
            log::info!("refusing new {side:?} connection: another is ongoing");
            return Ok(false);
        }
        state.install_stream(side, stream);
    }

    let open_result = shared
        .handler(side)
        .lock()
        .unwrap_or_else(|_| fatal("handler mutex poisoned"))
        .open();

    match open_result {
        Ok(()) => {
            let mut state = shared.lock_state();
            let token = match side {
                Side::Client => reactor::CLIENT_STREAM,
                Side::Dnode => reactor::DNODE_STREAM,
            };
            if let Some(s) = state.stream_mut(side) {
                reactor.register_stream(s, token)?;
            }
            drop(state);
            log::info!("{side:?} connection established");
            Ok(true)
        }
        Err(e) => {
            log::warn!("can't open {side:?} connection: {e}; refusing it");
            shared.lock_state().clear_stream(side);
            Ok(false)
        }
    }
}

/// The connection-close protocol: deregister and free the
/// endpoint, clear any in-flight transactions (discarding their results),
/// then invoke the side's `close` hook. A no-op if the side was already
/// detached (the original asserts this can't happen; the Rust port is
/// defensive instead, since hitting it would otherwise panic a production
/// reactor loop over what's ultimately just a logic bug in a caller).
fn detach(shared: &Arc<Shared>, reactor: &Reactor, side: Side) {
    let mut cleared_txns = false;
    {
        let mut state = shared.lock_state();
        if !state.has_stream(side) {
            return;
        }
        if let Some(s) = state.stream_mut(side) {
            let _ = reactor.deregister_stream(s);
        }
        state.clear_stream(side);
        if !state.txns.is_empty() {
            cleared_txns = true;
            state.txns.clear();
        }
    }
    if cleared_txns {
        log::info!("halting data node I/O due to closed {side:?} connection");
    }
    shared
        .handler(side)
        .lock()
        .unwrap_or_else(|_| fatal("handler mutex poisoned"))
        .close();
}

/// Runs a side's `read` hook against its ingress buffer and folds the
/// resulting wake reasons into `wake_why`. Mirrors `control_bev_reader`.
fn dispatch_read(shared: &Arc<Shared>, side: Side) -> WakeReason {
    let mut state = shared.lock_state();
    let mut handler = shared
        .handler(side)
        .lock()
        .unwrap_or_else(|_| fatal("handler mutex poisoned"));
    let why = handler.read(&mut state);
    state.wake(why);
    why
}

/// The control-plane intermediary: one client listener, one data-node
/// stream, one UDP sample socket, and the background worker that drives
/// both sides' `thread` hooks. Created by [`ControlSession::new`], run by
/// repeatedly calling [`ControlSession::run`] (or [`ControlSession::poll_once`]
/// in a caller-owned loop), and torn down by dropping it.
pub struct ControlSession {
    reactor: Reactor,
    sample_socket: UdpSocket,
    shared: Arc<Shared>,
    listener: TcpListener,
    worker: Option<JoinHandle<()>>,
}

impl ControlSession {
    /// Creates a new session: a client listener on `client_port`, a
    /// connection to the data node at `dnode_addr:dnode_port`, and a bound
    /// UDP socket on `sample_port`. Every step mirrors `control_new`,
    /// including invoking `client_handler.start()` before
    /// `dnode_handler.start()`, then attaching the data-node connection,
    /// then opening the sample socket, then spawning the worker last.
    pub fn new(
        client_port: u16,
        dnode_addr: &str,
        dnode_port: u16,
        sample_port: u16,
        client_handler: Box<dyn SideHandler>,
        dnode_handler: Box<dyn SideHandler>,
    ) -> Result<Self, CoreError> {
        let reactor = Reactor::new()?;

        let mut listener = TcpListener::from_std(sockutil::tcp_passive(client_port).map_err(|e| {
            log::error!("can't listen for client connections on port {client_port}: {e}");
            e
        })?);
        reactor.register_listener(&mut listener)?;

        let dnode_std = sockutil::tcp_connect_timeout(dnode_addr, dnode_port, Duration::from_secs(5))
            .map_err(|e| {
                log::error!("can't connect to data node at {dnode_addr}, port {dnode_port}: {e}");
                e
            })?;

        let mut client_handler = client_handler;
        let mut dnode_handler = dnode_handler;
        if let Err(e) = client_handler.start() {
            log::error!("can't start client side of control session: {e}");
            return Err(e);
        }
        if let Err(e) = dnode_handler.start() {
            log::error!("can't start data node side of control session: {e}");
            client_handler.stop();
            return Err(e);
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::new()),
            cv: Condvar::new(),
            client_handler: Mutex::new(client_handler),
            dnode_handler: Mutex::new(dnode_handler),
        });

        let dnode_stream = TcpStream::from_std(dnode_std);
        match attach(&shared, &reactor, Side::Dnode, dnode_stream) {
            Ok(true) => {}
            Ok(false) => {
                // Can't happen on a freshly constructed session (nothing
                // else could have occupied the dnode slot yet), but treat
                // it as a hard failure rather than silently limping on.
                stop_handlers(&shared);
                return Err(CoreError::Fatal("data node connection was refused on a new session".into()));
            }
            Err(e) => {
                log::error!("can't attach data node connection: {e}");
                stop_handlers(&shared);
                return Err(e);
            }
        }

        let sample_std = match sockutil::udp_bound(sample_port) {
            Ok(s) => s,
            Err(e) => {
                log::error!("can't create sample ingress socket on port {sample_port}: {e}");
                detach(&shared, &reactor, Side::Dnode);
                stop_handlers(&shared);
                return Err(e);
            }
        };
        let mut sample_socket = UdpSocket::from_std(sample_std);
        if let Err(e) = reactor.register_datagram(&mut sample_socket) {
            detach(&shared, &reactor, Side::Dnode);
            stop_handlers(&shared);
            return Err(e.into());
        }

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("daqctl-worker".into())
            .spawn(move || worker::run(worker_shared))
            .map_err(|e| {
                log::error!("can't start control worker thread: {e}");
                CoreError::Fatal(format!("can't start worker thread: {e}"))
            });
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                detach(&shared, &reactor, Side::Dnode);
                stop_handlers(&shared);
                return Err(e);
            }
        };

        Ok(ControlSession {
            reactor,
            sample_socket,
            shared,
            listener,
            worker: Some(worker),
        })
    }

    /// Blocks up to `timeout` for I/O readiness and dispatches whatever
    /// comes in: accepting new client connections, draining readable
    /// streams and running their `read` hooks, and draining (and
    /// discarding, per the non-goal on in-core sample rewriting) UDP
    /// sample datagrams. A `Fatal` error means a `read` hook asserted
    /// `EXIT`, the caller should log it and abort, matching
    /// `control_fatal_err`'s behavior, rather than this module calling
    /// `process::abort` itself out from under a caller that might want to
    /// shut down more gracefully first.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), CoreError> {
        // Collect what's ready before touching `self` mutably again: the
        // `Events` batch borrows `self.reactor`, and dispatch needs `&mut
        // self`, so the readiness info is copied out first.
        let mut ready: Vec<(mio::Token, bool, bool, bool)> = Vec::new();
        {
            let events = self.reactor.poll(timeout)?;
            for event in events.iter() {
                ready.push((event.token(), event.is_readable(), event.is_writable(), event.is_error()));
            }
        }
        for (token, readable, writable, errored) in ready {
            if token == reactor::CLIENT_LISTENER {
                if readable {
                    self.accept_clients()?;
                }
            } else if token == reactor::CLIENT_STREAM {
                self.dispatch_stream(Side::Client, readable, writable, errored)?;
            } else if token == reactor::DNODE_STREAM {
                self.dispatch_stream(Side::Dnode, readable, writable, errored)?;
            } else if token == reactor::SAMPLE_DATAGRAM {
                if readable {
                    self.drain_samples()?;
                }
            }
        }
        Ok(())
    }

    /// Runs [`poll_once`](Self::poll_once) forever. Returns only on a
    /// `Fatal` error.
    pub fn run(&mut self) -> Result<(), CoreError> {
        loop {
            self.poll_once(Some(Duration::from_millis(250)))?;
        }
    }

    fn accept_clients(&mut self) -> Result<(), CoreError> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    attach(&self.shared, &self.reactor, Side::Client, stream)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("client accept() failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch_stream(&mut self, side: Side, readable: bool, writable: bool, errored: bool) -> Result<(), CoreError> {
        if readable {
            match self.drain_stream(side)? {
                true => {
                    detach(&self.shared, &self.reactor, side);
                    log::info!("{side:?} connection closed");
                    return Ok(());
                }
                false => {
                    let why = dispatch_read(&self.shared, side);
                    if why.contains(WakeReason::EXIT) {
                        return Err(CoreError::Fatal(format!(
                            "{side:?} socket reader wants to shut down the worker"
                        )));
                    }
                    if !why.is_empty() {
                        self.shared.notify_worker();
                    }
                }
            }
        }
        if writable {
            let mut state = self.shared.lock_state();
            if state.has_stream(side) {
                if let Err(e) = state.flush_pending(side) {
                    log::warn!("write to {side:?} stream failed: {e}; treating as connection loss");
                    drop(state);
                    detach(&self.shared, &self.reactor, side);
                    return Ok(());
                }
            }
        }
        if errored {
            log::warn!("unhandled {side:?} event; treating as connection loss");
            detach(&self.shared, &self.reactor, side);
        }
        Ok(())
    }

    /// Reads whatever bytes are available off `side`'s stream into its
    /// ingress buffer. Returns `Ok(true)` on EOF (a zero-length read).
    fn drain_stream(&mut self, side: Side) -> Result<bool, CoreError> {
        let mut state = self.shared.lock_state();
        let (stream_opt, inbuf) = state.stream_and_inbuf_mut(side);
        let Some(stream) = stream_opt else {
            return Ok(false);
        };
        let mut tmp = [0u8; 4096];
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => return Ok(true),
                Ok(n) => inbuf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drains the UDP sample socket. With no client-side forward endpoint
    /// attached (always true today, see [`SessionState::forward_attached`]),
    /// every datagram is read and immediately discarded, logging once.
    fn drain_samples(&mut self) -> Result<(), CoreError> {
        let mut buf = [0u8; 65536];
        loop {
            match self.sample_socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    log::warn!(
                        "received {n} bytes from the data node, but no one wants it; dropping the packet"
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn stop_handlers(shared: &Arc<Shared>) {
    shared
        .client_handler
        .lock()
        .unwrap_or_else(|_| fatal("handler mutex poisoned"))
        .stop();
    shared
        .dnode_handler
        .lock()
        .unwrap_or_else(|_| fatal("handler mutex poisoned"))
        .stop();
}

impl Drop for ControlSession {
    /// Mirrors `control_free`: post `EXIT`, join the worker, then release
    /// resources. The UDP socket, the data-node stream (inside `shared`)
    /// and the client listener close automatically as this struct's
    /// fields drop in declaration order after this function returns,
    /// which is why they're declared in the same reverse-of-acquisition
    /// order `control_free` frees them in by hand.
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.wake(WakeReason::EXIT);
        }
        self.shared.notify_worker();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        stop_handlers(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;
    use crate::proto::{self, Flags, ReqRes};
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A data-node-side handler that completes the in-flight transaction
    /// the moment a matching `Response` packet shows up in its ingress
    /// buffer. Used to exercise the reactor's read-dispatch path without
    /// needing a concrete protocol implementation.
    #[derive(Default)]
    struct DnodeResponseHandler;

    impl SideHandler for DnodeResponseHandler {
        fn read(&mut self, state: &mut SessionState) -> WakeReason {
            loop {
                let buf = state.dnode_inbuf();
                let (packet, consumed) = match proto::decode_from_buffer(buf, None) {
                    Ok(Some(pair)) => pair,
                    Ok(None) => return WakeReason::empty(),
                    Err(_) => return WakeReason::empty(),
                };
                let r_id = match &packet.payload {
                    proto::Payload::Response(r) => r.r_id,
                    _ => {
                        state.dnode_inbuf().drain(..consumed);
                        continue;
                    }
                };
                state.dnode_inbuf().drain(..consumed);
                state.txns.complete_current(packet, r_id);
            }
        }
    }

    static PORT_COUNTER: AtomicU32 = AtomicU32::new(18900);
    static PORT_LOCK: StdMutex<()> = StdMutex::new(());

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst) as u16
    }

    /// Spins up a fake data node (a bare TCP listener) and a session
    /// pointed at it, returning the session, its client-listening port and
    /// the fake data node's accepted socket (so a test can play the data
    /// node's part). Port allocation is serialized across tests since they
    /// share the process's ephemeral-port-free range.
    fn new_test_session(dnode_handler: Box<dyn SideHandler>) -> (ControlSession, u16, StdTcpStream) {
        let _guard = PORT_LOCK.lock().unwrap();
        let dnode_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dnode_port = dnode_listener.local_addr().unwrap().port();
        let client_port = next_port();
        let sample_port = next_port();

        let accepting = std::thread::spawn(move || dnode_listener.accept().unwrap().0);
        let session = ControlSession::new(
            client_port,
            "127.0.0.1",
            dnode_port,
            sample_port,
            Box::new(NoopHandler),
            dnode_handler,
        )
        .expect("session creation should succeed against a listening fake dnode");
        let fake_dnode = accepting.join().unwrap();
        (session, client_port, fake_dnode)
    }

    #[test]
    fn single_session_refuses_a_second_client() {
        let (mut session, client_port, _fake_dnode) = new_test_session(Box::new(NoopHandler));

        let first = StdTcpStream::connect(("127.0.0.1", client_port)).unwrap();
        for _ in 0..20 {
            session.poll_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert!(session.shared.lock_state().client_connected());

        let mut second = StdTcpStream::connect(("127.0.0.1", client_port)).unwrap();
        for _ in 0..20 {
            session.poll_once(Some(Duration::from_millis(20))).unwrap();
        }
        // The second connection should have been closed by the session;
        // a read on it now observes EOF.
        let mut buf = [0u8; 1];
        let n = second.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "second client connection should have been refused");
        assert!(session.shared.lock_state().client_connected());

        drop(first);
    }

    #[test]
    fn disconnect_clears_in_flight_transactions() {
        let (mut session, client_port, _fake_dnode) = new_test_session(Box::new(NoopHandler));

        let client = StdTcpStream::connect(("127.0.0.1", client_port)).unwrap();
        for _ in 0..20 {
            session.poll_once(Some(Duration::from_millis(20))).unwrap();
        }

        // Install three pending transactions directly, as a client-side
        // handler's `read` hook would after parsing a client command.
        {
            let mut state = session.shared.lock_state();
            let txns = (0..3)
                .map(|i| {
                    crate::txn::Transaction::new(proto::Packet::request(
                        Flags::empty(),
                        ReqRes {
                            r_id: 0,
                            r_type: 1,
                            r_addr: 0,
                            r_val: i,
                        },
                    ))
                })
                .collect();
            state.txns.set(txns);
            assert_eq!(state.txns.cur_txn(), 0);
        }

        drop(client);
        for _ in 0..20 {
            session.poll_once(Some(Duration::from_millis(20))).unwrap();
        }

        let state = session.shared.lock_state();
        assert!(state.txns.is_empty());
        assert_eq!(state.txns.cur_txn(), -1);
        assert_eq!(state.txns.len(), 0);
    }

    #[test]
    fn request_response_round_trip_through_dnode() {
        let (mut session, _client_port, mut fake_dnode) =
            new_test_session(Box::new(DnodeResponseHandler));
        fake_dnode.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        {
            let mut state = session.shared.lock_state();
            state.txns.set(vec![crate::txn::Transaction::new(proto::Packet::request(
                Flags::empty(),
                ReqRes {
                    r_id: 0,
                    r_type: 1,
                    r_addr: 0,
                    r_val: 0xDEAD_BEEF,
                },
            ))]);
            let request = state.txns.current().unwrap().request.clone();
            let bytes = proto::encode(&request).unwrap();
            state.write_dnode(&bytes).unwrap();
        }

        // Act as the data node: read the request off the wire and reply
        // with its value bitwise-negated.
        let mut header = [0u8; 8];
        fake_dnode.read_exact(&mut header).unwrap();
        let mut payload = [0u8; 8];
        fake_dnode.read_exact(&mut payload).unwrap();
        let r_id = u16::from_be_bytes([payload[0], payload[1]]);
        let r_val = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let response = proto::Packet::response(
            Flags::empty(),
            ReqRes {
                r_id,
                r_type: payload[2],
                r_addr: payload[3],
                r_val: !r_val,
            },
        );
        fake_dnode.write_all(&proto::encode(&response).unwrap()).unwrap();

        let mut accepted = false;
        for _ in 0..50 {
            session.poll_once(Some(Duration::from_millis(20))).unwrap();
            if session
                .shared
                .lock_state()
                .txns
                .current()
                .and_then(|t| t.response.as_ref())
                .is_some()
            {
                accepted = true;
                break;
            }
        }

        assert!(accepted, "expected the echoed response to complete the transaction");
        let state = session.shared.lock_state();
        match &state.txns.current().unwrap().response {
            Some(proto::Packet {
                payload: proto::Payload::Response(r),
                ..
            }) => assert_eq!(r.r_val, !0xDEAD_BEEFu32),
            other => panic!("unexpected response slot: {other:?}"),
        }
    }
}
