//! Producer-side credit ledger.
//!
//! Each process keeps, per peer, how much credit it still has from peers it
//! sends to (`credit_from`) and how much it has granted to peers sending to
//! it (`credit_to`). Grants travel as bump messages. A process that is
//! itself blocked defers its outgoing grants until it unblocks; coupling the
//! two directions this way stops an overloaded intermediary from issuing
//! credit faster than it drains.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

pub const MAX_CREDIT: i64 = 200;
pub const MORE_CREDIT_AT: i64 = 150;

/// Sink for outgoing bump messages. In production this is a channel send to
/// the peer's mailbox; tests capture grants directly.
pub type BumpSender<P> = Box<dyn Fn(&P, i64) + Send>;

pub struct CreditFlow<P: Eq + Hash + Clone> {
    credit_from: HashMap<P, i64>,
    credit_to: HashMap<P, i64>,
    blocked: HashSet<P>,
    deferred: Vec<(P, i64)>,
    bump: BumpSender<P>,
}

impl<P: Eq + Hash + Clone> CreditFlow<P> {
    pub fn new(bump: BumpSender<P>) -> Self {
        Self {
            credit_from: HashMap::new(),
            credit_to: HashMap::new(),
            blocked: HashSet::new(),
            deferred: Vec::new(),
            bump,
        }
    }

    /// Record one send towards `peer`. Returns `false` once `peer` has
    /// driven us out of credit; callers stop sending until a bump arrives.
    pub fn send(&mut self, peer: &P) -> bool {
        let credit = self.credit_from.entry(peer.clone()).or_insert(MAX_CREDIT);
        *credit -= 1;
        if *credit <= 0 {
            self.blocked.insert(peer.clone());
            return false;
        }
        true
    }

    /// Record that one message from `peer` has been processed. Crossing
    /// `MORE_CREDIT_AT` downward issues a grant and resets the ledger.
    pub fn ack(&mut self, peer: &P) {
        let credit = self.credit_to.entry(peer.clone()).or_insert(MAX_CREDIT);
        *credit -= 1;
        if *credit == MORE_CREDIT_AT {
            *credit = MAX_CREDIT;
            self.grant(peer.clone(), MAX_CREDIT - MORE_CREDIT_AT);
        }
    }

    /// A bump from `peer` restores our sending credit.
    pub fn handle_bump(&mut self, peer: &P, quantity: i64) {
        let credit = self.credit_from.entry(peer.clone()).or_insert(MAX_CREDIT);
        *credit += quantity;
        if *credit > 0 && self.blocked.remove(peer) && self.blocked.is_empty() {
            self.flush_deferred();
        }
    }

    /// Forget everything about a dead peer. Idempotent.
    pub fn peer_down(&mut self, peer: &P) {
        self.credit_from.remove(peer);
        self.credit_to.remove(peer);
        if self.blocked.remove(peer) && self.blocked.is_empty() {
            self.flush_deferred();
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn is_blocked_by(&self, peer: &P) -> bool {
        self.blocked.contains(peer)
    }

    fn grant(&mut self, peer: P, quantity: i64) {
        if self.blocked.is_empty() {
            (self.bump)(&peer, quantity);
        } else {
            self.deferred.push((peer, quantity));
        }
    }

    fn flush_deferred(&mut self) {
        for (peer, quantity) in self.deferred.drain(..) {
            (self.bump)(&peer, quantity);
        }
    }

    #[cfg(debug_assertions)]
    pub fn assert_invariants(&self) {
        let any_exhausted = self.credit_from.values().any(|c| *c <= 0);
        debug_assert_eq!(!self.blocked.is_empty(), any_exhausted);
        for peer in &self.blocked {
            debug_assert!(self.credit_from.get(peer).copied().unwrap_or(MAX_CREDIT) <= 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn flow() -> (CreditFlow<u32>, mpsc::Receiver<(u32, i64)>) {
        let (tx, rx) = mpsc::channel();
        let flow = CreditFlow::new(Box::new(move |peer: &u32, n| {
            let _ = tx.send((*peer, n));
        }));
        (flow, rx)
    }

    #[test]
    fn send_blocks_at_zero() {
        let (mut flow, _rx) = flow();
        for _ in 0..MAX_CREDIT - 1 {
            assert!(flow.send(&1));
        }
        assert!(!flow.send(&1));
        assert!(flow.is_blocked());
        assert!(flow.is_blocked_by(&1));
        flow.assert_invariants();
    }

    #[test]
    fn ack_grants_at_threshold() {
        let (mut flow, rx) = flow();
        for _ in 0..(MAX_CREDIT - MORE_CREDIT_AT - 1) {
            flow.ack(&7);
            assert!(rx.try_recv().is_err());
        }
        flow.ack(&7);
        assert_eq!(rx.try_recv().unwrap(), (7, MAX_CREDIT - MORE_CREDIT_AT));
        // Ledger reset: next grant takes another full window.
        for _ in 0..(MAX_CREDIT - MORE_CREDIT_AT - 1) {
            flow.ack(&7);
            assert!(rx.try_recv().is_err());
        }
        flow.ack(&7);
        assert_eq!(rx.try_recv().unwrap(), (7, MAX_CREDIT - MORE_CREDIT_AT));
    }

    #[test]
    fn grants_defer_while_blocked() {
        let (mut flow, rx) = flow();
        for _ in 0..MAX_CREDIT {
            flow.send(&1);
        }
        assert!(flow.is_blocked());

        for _ in 0..(MAX_CREDIT - MORE_CREDIT_AT) {
            flow.ack(&9);
        }
        // Grant earned but deferred behind our own block.
        assert!(rx.try_recv().is_err());

        flow.handle_bump(&1, 50);
        // Unblocked: the deferred grant flushes.
        assert_eq!(rx.try_recv().unwrap(), (9, MAX_CREDIT - MORE_CREDIT_AT));
        assert!(!flow.is_blocked());
        flow.assert_invariants();
    }

    #[test]
    fn peer_down_unblocks_and_flushes() {
        let (mut flow, rx) = flow();
        for _ in 0..MAX_CREDIT {
            flow.send(&1);
        }
        for _ in 0..(MAX_CREDIT - MORE_CREDIT_AT) {
            flow.ack(&9);
        }
        assert!(rx.try_recv().is_err());

        flow.peer_down(&1);
        assert!(!flow.is_blocked());
        assert_eq!(rx.try_recv().unwrap(), (9, MAX_CREDIT - MORE_CREDIT_AT));
        // Idempotent.
        flow.peer_down(&1);
        flow.assert_invariants();
    }
}
