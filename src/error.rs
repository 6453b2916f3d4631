//! Error kinds surfaced by the core.
//!
//! These map onto the kinds named in the design: `Protocol`, `Io`,
//! `InvalidArgument`, `OutOfMemory` and `Fatal`. Binaries wrap these with
//! `color_eyre` for user-facing context; the core itself only ever
//! returns `CoreError`.

use std::fmt;
use std::io;

/// Errors the core can surface to a side handler or a caller.
#[derive(Debug)]
pub enum CoreError {
    /// Magic/version mismatch, or an unrecognized packet type on receive.
    Protocol(String),
    /// Underlying socket I/O failure, or a type mismatch against the
    /// caller's expectation on receive.
    Io(io::Error),
    /// An unknown or unsupported packet type was passed to an operation
    /// that must discriminate on it.
    InvalidArgument(String),
    /// Allocation failure while sizing a packet or session.
    OutOfMemory(String),
    /// A programmer error (mutex/condvar failure, a read hook demanding
    /// `EXIT`, or an unexpected worker exit). Always fatal to the process.
    Fatal(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            CoreError::Io(err) => write!(f, "I/O error: {err}"),
            CoreError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            CoreError::OutOfMemory(msg) => write!(f, "out of memory: {msg}"),
            CoreError::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        CoreError::Io(err)
    }
}

impl CoreError {
    /// True for the subset of errors that should never be recovered from:
    /// a mutex/condvar operation failing, or the worker exiting on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }
}

/// Logs the message at `error` level and aborts the process. Used for the
/// `Fatal` kind, which the design treats as a programmer error with no
/// recovery path (mutex poisoning, an unexpected worker exit, a `read`
/// hook requesting `EXIT`).
pub fn fatal(message: impl fmt::Display) -> ! {
    log::error!("fatal error in control session: {message}");
    std::process::abort();
}
