//! Control-plane intermediary between a commanding client and a
//! data-acquisition node.
//!
//! The crate is organized the way the design splits it: a wire codec
//! ([`proto`]), socket setup helpers ([`sockutil`]), an mio reactor
//! binding ([`reactor`]), a pending-transaction table ([`txn`]), the
//! pluggable side-handler contract ([`handler`]), the background worker
//! ([`worker`]) and the control session that ties them together
//! ([`session`]). Concrete client- and data-node-protocol implementations
//! are out of scope here, callers plug in their own [`handler::SideHandler`].

pub mod error;
pub mod handler;
pub mod proto;
pub mod reactor;
pub mod session;
pub mod sockutil;
pub mod txn;
mod worker;

pub use error::CoreError;
pub use handler::{NoopHandler, Side, SideHandler, WakeReason};
pub use proto::{BoardSample, Flags, Packet, PacketType, Payload, ReqRes};
pub use session::ControlSession;
pub use txn::{Transaction, TransactionTable};

/// Default data-node command/control TCP port, `DNODE_CC_PORT` in the
/// original `main.c`.
pub const DEFAULT_DNODE_PORT: u16 = 8880;

/// Default UDP sample-ingress port, `DNODE_DT_PORT` in the original
/// `main.c`.
pub const DEFAULT_SAMPLE_PORT: u16 = 8881;

/// Default data-node host, matching `main.c`'s `DNODE_HOST`.
pub const DEFAULT_DNODE_HOST: &str = "127.0.0.1";
