//! The wake-reason bitset and the pluggable side-handler contract.
//!
//! Grounded in `control-private.h`'s `enum control_worker_why` and the
//! `control_client_ops`/`control_dnode_ops` function-pointer tables,
//! recovered from their call sites in `control.c` (`control_client_start`,
//! `_stop`, `_open`, `_close`, `_read`, `_thread` and their dnode-side
//! twins). Design note §9 calls for a "capability interface with all
//! methods optional (null = no-op)" passed in by constructor injection
//! rather than a process-wide singleton, that's `SideHandler`, a trait
//! with default no-op bodies, given to `ControlSession::new` once per side.

use bitflags::bitflags;

use crate::session::SessionState;
use crate::error::CoreError;

bitflags! {
    /// Bits a `read` hook (or the reactor itself) can assert to tell the
    /// worker what class of work it owes. Matches `enum control_worker_why`
    /// exactly, including that `NONE` is the all-zero value and that
    /// multiple bits may be asserted at once.
    #[derive(Default)]
    pub struct WakeReason: u8 {
        /// The client delivered a new command the worker should act on.
        const CLIENT_CMD = 0b0001;
        /// A response is ready to ship back to the client.
        const CLIENT_RES = 0b0010;
        /// Advance the transaction queue toward the data node.
        const DNODE_TXN = 0b0100;
        /// Tear the session down; the worker must exit after seeing this.
        const EXIT = 0b1000;
    }
}

/// Which side of the session a handler instance is serving. Mirrors the
/// two separate ops tables (`control_client_ops` vs `control_dnode_ops`):
/// the core never mixes the two up, but a single struct may implement
/// `SideHandler` twice, once under each role, if that's convenient.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
    Client,
    Dnode,
}

/// The contract a client-side or data-node-side protocol implementation
/// must satisfy. Every method is optional, the default body is a no-op
/// (or, for `read`, `WakeReason::empty()`), matching "a null hook is a
/// no-op" from the design. The core calls into a handler; a handler never
/// calls back into the core except through the `SessionState` it's given.
pub trait SideHandler: Send {
    /// Called once, during session creation, before any connection is
    /// attached. May allocate per-side state. Mirrors `cs_start`.
    fn start(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called once, during session destruction. Mirrors `cs_stop`.
    fn stop(&mut self) {}

    /// Called after a new connection is attached to this side. May
    /// initialize per-connection state. A failure here causes the
    /// connection to be refused (the stream endpoint is freed and the
    /// slot cleared). Mirrors `cs_open`.
    fn open(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called after this side's connection has been detached. Mirrors
    /// `cs_close`.
    fn close(&mut self) {}

    /// Called when this side's stream has readable bytes waiting in its
    /// ingress buffer (`state.client_inbuf` or `state.dnode_inbuf`). May
    /// parse complete packets out of that buffer, enqueue transactions via
    /// `state.txns`, and returns the wake reasons the worker now owes.
    /// Returning `WakeReason::EXIT` is treated as a fatal protocol
    /// violation, not a graceful shutdown request. Use a connection close
    /// instead for anything recoverable. Mirrors `cs_read`.
    fn read(&mut self, state: &mut SessionState) -> WakeReason {
        let _ = state;
        WakeReason::empty()
    }

    /// Called by the worker thread, with the session mutex held for the
    /// duration, whenever one of this side's wake bits is asserted. Must
    /// clear the bits it consumed from `state.wake_why` before returning,
    /// and must not perform unbounded blocking I/O (the mutex is held).
    /// Mirrors `cs_thread`.
    fn thread(&mut self, state: &mut SessionState, why: WakeReason) {
        let _ = (state, why);
    }
}

/// A handler that does nothing on every hook. Used as the session's
/// default side handler when no concrete client- or data-node-protocol
/// implementation has been plugged in (those are external collaborators
/// per the design's scope), it keeps the session alive and able to
/// accept/refuse connections without ever itself driving a transaction.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl SideHandler for NoopHandler {}
