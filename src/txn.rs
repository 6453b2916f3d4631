//! Pending request/response transaction table.
//!
//! Grounded in `control_set_transactions`/`control_clear_transactions` and
//! the `ctl_txns`/`ctl_n_txns`/`ctl_cur_txn`/`ctl_cur_rid` fields of
//! `struct control_session` in `control.c`. A transaction list is installed
//! once, worked through strictly in order one at a time, and cleared as a
//! unit, there is no partial replacement.

use crate::proto::{Packet, ReqRes};

/// One outstanding request, paired with the response slot it will fill in.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub request: Packet,
    pub response: Option<Packet>,
}

impl Transaction {
    pub fn new(request: Packet) -> Self {
        Transaction {
            request,
            response: None,
        }
    }

    /// The `r_id` stamped into this transaction's request, if it carries a
    /// `Request`/`Response` payload (the only payload shapes `set` stamps).
    fn req_res_mut(&mut self) -> Option<&mut ReqRes> {
        match &mut self.request.payload {
            crate::proto::Payload::Request(r) | crate::proto::Payload::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// The session's single pending-transaction list: a cursor over a
/// contiguous sequence plus a session-scoped request-ID counter.
///
/// Invariant (matches `control_set_transactions`'s assertion): a new list
/// may only be installed with `set` when the table is already empty
/// (`is_empty()`); the only other legal operation on a non-empty table is
/// `clear`.
#[derive(Debug, Default)]
pub struct TransactionTable {
    txns: Vec<Transaction>,
    cur_txn: isize,
    cur_rid: u16,
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable {
            txns: Vec::new(),
            cur_txn: -1,
            cur_rid: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty() && self.cur_txn == -1
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    /// The in-flight transaction, if any (`cur_txn`'s index into `txns`).
    pub fn current(&self) -> Option<&Transaction> {
        if self.cur_txn < 0 {
            return None;
        }
        self.txns.get(self.cur_txn as usize)
    }

    pub fn current_mut(&mut self) -> Option<&mut Transaction> {
        if self.cur_txn < 0 {
            return None;
        }
        self.txns.get_mut(self.cur_txn as usize)
    }

    pub fn cur_txn(&self) -> isize {
        self.cur_txn
    }

    pub fn cur_rid(&self) -> u16 {
        self.cur_rid
    }

    /// Installs a new transaction list, stamping each request's `r_id`
    /// starting at `cur_rid` and advancing `cur_rid` by `txns.len()`.
    /// Mirrors `control_set_transactions(cs, txns, n, have_lock)` for the
    /// `n > 0` case.
    ///
    /// # Panics
    ///
    /// Panics (via `debug_assert!` in debug builds; the precondition still
    /// holds in release, it's just unchecked there, matching the C
    /// `assert()`) if the table is not already empty.
    pub fn set(&mut self, mut txns: Vec<Transaction>) {
        debug_assert!(
            self.is_empty(),
            "set() called on a non-empty transaction table; only clear() is legal"
        );
        if txns.is_empty() {
            self.txns = txns;
            self.cur_txn = -1;
            return;
        }
        for txn in txns.iter_mut() {
            if let Some(req) = txn.req_res_mut() {
                req.r_id = self.cur_rid;
            }
            self.cur_rid = self.cur_rid.wrapping_add(1);
        }
        self.txns = txns;
        self.cur_txn = 0;
    }

    /// Clears the transaction list unconditionally, the response to a
    /// disconnect on either side. Equivalent to
    /// `control_set_transactions(cs, NULL, 0, have_lock)`.
    pub fn clear(&mut self) {
        self.txns.clear();
        self.cur_txn = -1;
    }

    /// Records the response for the in-flight transaction if `r_id`
    /// matches; otherwise the response is discarded (a stale reply from a
    /// transaction that's no longer in flight). Returns `true` if the
    /// response was accepted.
    pub fn complete_current(&mut self, response: Packet, r_id: u16) -> bool {
        let Some(txn) = self.current_mut() else {
            return false;
        };
        let expected = match &txn.request.payload {
            crate::proto::Payload::Request(r) => r.r_id,
            _ => return false,
        };
        if expected != r_id {
            return false;
        }
        txn.response = Some(response);
        true
    }

    /// Advances past the completed in-flight transaction to the next one,
    /// or to idle (`-1`) if that was the last.
    pub fn advance(&mut self) {
        if self.cur_txn < 0 {
            return;
        }
        let next = self.cur_txn + 1;
        if (next as usize) < self.txns.len() {
            self.cur_txn = next;
        } else {
            self.cur_txn = -1;
        }
    }
}
