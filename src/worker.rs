//! The background worker thread: C5 from the design.
//!
//! Grounded in `control_worker_main` from `control.c`: one thread, parked
//! on a condition variable until `wake_why` is non-zero, dispatching to
//! whichever side(s) asserted a bit while holding the session mutex for
//! the whole dispatch, and exiting the moment `EXIT` is seen. The client
//! and data-node `thread` hooks are independent of each other (a
//! `CLIENT_CMD`/`CLIENT_RES` wake doesn't imply `DNODE_TXN` and vice
//! versa), exactly as `control_worker_main` tests each bit separately.

use std::sync::Arc;

use crate::error::fatal;
use crate::handler::WakeReason;
use crate::session::Shared;

/// Runs until the session posts `EXIT`. Takes ownership of the thread: the
/// `JoinHandle` this produces (see `ControlSession::new`) is what
/// `ControlSession`'s `Drop` joins on.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        let mut state = shared
            .state()
            .lock()
            .unwrap_or_else(|_| fatal("session mutex poisoned"));
        while state.wake_why().is_empty() {
            state = shared.wait_for_wake(state);
        }

        let why = state.wake_why();
        if why.contains(WakeReason::EXIT) {
            return;
        }

        if why.intersects(WakeReason::CLIENT_CMD | WakeReason::CLIENT_RES) {
            let mut handler = shared
                .client_handler()
                .lock()
                .unwrap_or_else(|_| fatal("handler mutex poisoned"));
            handler.thread(&mut state, why);
        }
        if why.contains(WakeReason::DNODE_TXN) {
            let mut handler = shared
                .dnode_handler()
                .lock()
                .unwrap_or_else(|_| fatal("handler mutex poisoned"));
            handler.thread(&mut state, why);
        }

        drop(state);
    }
}
