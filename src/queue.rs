// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The ordering queue turns unordered delivery into a total order.
//!
//! Descriptors wait here keyed by [TxnId]. The smallest one may run only when
//! no smaller txn can still show up, which the queue establishes per
//! initiator:
//!
//!   - Each fragment names the txn its initiator routed to this partition
//!     just before it (`prev`). The queue follows these links from the last
//!     linked txn (the chain's tail); a fragment whose predecessor hasn't
//!     arrived yet is a gap, and nothing from that initiator past the gap is
//!     linked.
//!
//!   - Each initiator also sends heartbeats naming a horizon below which it
//!     will never issue again, along with the last txn it routed here. Once
//!     the chain reaches that txn the horizon holds.
//!
//! A txn `T` from initiator `I` is ready when it is linked in `I`'s chain and
//! every other known initiator's bound (its tail or held horizon) is at or
//! above `T`. Anything at or below the snapshot cutoff counts as already
//! present, since the snapshot covers it.

use crate::{Descriptor, SiteId, TxnId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

#[derive(Debug, Default)]
struct Chain {
    /// Last txn from this initiator whose whole chain has arrived.
    tail: Option<TxnId>,
    /// Arrived but not yet linked, keyed by txn, valued by predecessor.
    unlinked: BTreeMap<TxnId, Option<TxnId>>,
    /// Heartbeats whose `last_routed` hasn't been reached: horizon -> last_routed.
    promises: BTreeMap<TxnId, Option<TxnId>>,
    /// Largest horizon whose promise holds.
    horizon: Option<TxnId>,
}

impl Chain {
    fn covered(txn: Option<TxnId>, cutoff: Option<TxnId>) -> bool {
        match (txn, cutoff) {
            (None, _) => true,
            (Some(t), Some(s)) => t <= s,
            (Some(_), None) => false,
        }
    }

    fn reached(&self, txn: Option<TxnId>, cutoff: Option<TxnId>) -> bool {
        Self::covered(txn, cutoff)
            || match (txn, self.tail) {
                (Some(t), Some(tail)) => t <= tail,
                _ => false,
            }
    }

    fn links(&self, prev: Option<TxnId>, cutoff: Option<TxnId>) -> bool {
        prev == self.tail || (Self::covered(prev, cutoff) && Self::covered(self.tail, cutoff))
    }

    fn settle(&mut self, cutoff: Option<TxnId>) {
        loop {
            let (txn, prev) = match self.unlinked.iter().next() {
                Some((t, p)) => (*t, *p),
                None => break,
            };
            if !self.links(prev, cutoff) {
                break;
            }
            self.unlinked.remove(&txn);
            self.tail = Some(txn);
        }
        let held: Vec<TxnId> = self
            .promises
            .iter()
            .filter(|(_, last)| self.reached(**last, cutoff))
            .map(|(h, _)| *h)
            .collect();
        for h in held {
            self.promises.remove(&h);
            self.horizon = std::cmp::max(self.horizon, Some(h));
        }
    }

    fn linked(&self, txn: TxnId) -> bool {
        self.tail.map_or(false, |tail| txn <= tail)
    }

    fn bound(&self, cutoff: Option<TxnId>) -> Option<TxnId> {
        std::cmp::max(std::cmp::max(self.tail, self.horizon), cutoff)
    }
}

#[derive(Debug, Default)]
pub(crate) struct OrderingQueue {
    pending: BTreeMap<TxnId, Descriptor>,
    chains: BTreeMap<SiteId, Chain>,
    snapshot_cutoff: Option<TxnId>,
}

impl OrderingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_snapshot_cutoff(&mut self, cutoff: TxnId) {
        self.snapshot_cutoff = Some(cutoff);
        let cutoff = self.snapshot_cutoff;
        for chain in self.chains.values_mut() {
            chain.settle(cutoff);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn contains(&self, txn_id: TxnId) -> bool {
        self.pending.contains_key(&txn_id)
    }

    /// Accepts any descriptor; out-of-order arrivals simply wait.
    pub(crate) fn insert(&mut self, descriptor: Descriptor) {
        let cutoff = self.snapshot_cutoff;
        let txn_id = descriptor.txn_id;
        if !Chain::covered(Some(txn_id), cutoff) {
            let chain = self.chains.entry(descriptor.initiator).or_default();
            chain.unlinked.insert(txn_id, descriptor.prev);
            chain.settle(cutoff);
        }
        trace!("queued {:?} ({} pending)", txn_id, self.pending.len() + 1);
        self.pending.insert(txn_id, descriptor);
    }

    pub(crate) fn observe_heartbeat(
        &mut self,
        initiator: SiteId,
        horizon: TxnId,
        last_routed: Option<TxnId>,
    ) {
        let cutoff = self.snapshot_cutoff;
        let chain = self.chains.entry(initiator).or_default();
        if chain.horizon.map_or(false, |h| horizon <= h) {
            return;
        }
        chain.promises.insert(horizon, last_routed);
        chain.settle(cutoff);
    }

    /// Stops waiting on an initiator that has left the cluster.
    pub(crate) fn forget_initiator(&mut self, initiator: SiteId) {
        if let Some(chain) = self.chains.get_mut(&initiator) {
            chain.promises.clear();
        }
    }

    /// The head of the queue, if nothing smaller can still arrive.
    /// `passing_through` is the active recovery cutoff, if any: descriptors
    /// at or below it never run, so they never wait.
    pub(crate) fn next_ready(
        &self,
        initiators: &BTreeSet<SiteId>,
        passing_through: Option<TxnId>,
    ) -> Option<TxnId> {
        let (&head, descriptor) = self.pending.iter().next()?;
        if passing_through.map_or(false, |s| head <= s) {
            return Some(head);
        }
        let origin = descriptor.initiator;
        if !self.chains.get(&origin).map_or(false, |c| c.linked(head)) {
            trace!("head {:?} waits on a gap from {:?}", head, origin);
            return None;
        }
        for site in initiators.iter().filter(|s| **s != origin) {
            let bound = self
                .chains
                .get(site)
                .and_then(|c| c.bound(self.snapshot_cutoff))
                .or(self.snapshot_cutoff);
            if bound.map_or(true, |b| b < head) {
                trace!("head {:?} waits on horizon of {:?}", head, site);
                return None;
            }
        }
        Some(head)
    }

    pub(crate) fn pop(&mut self, txn_id: TxnId) -> Option<Descriptor> {
        self.pending.remove(&txn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, Fragment, Message, PartitionId, ProcedureInvocation};

    fn desc(clock: u64, from: u64, prev: Option<u64>) -> Descriptor {
        let site = SiteId(from);
        let env = Envelope::new(
            TxnId::new(clock, site),
            site,
            SiteId(1),
            Message::Fragment(Fragment {
                partition: PartitionId(0),
                invocation: ProcedureInvocation::default(),
                involved: vec![PartitionId(0)].into_iter().collect(),
                prev: prev.map(|p| TxnId::new(p, site)),
            }),
        );
        Descriptor::from_fragment(&env).expect("fragment")
    }

    fn sites(ns: &[u64]) -> BTreeSet<SiteId> {
        ns.iter().map(|n| SiteId(*n)).collect()
    }

    fn t(clock: u64, site: u64) -> TxnId {
        TxnId::new(clock, SiteId(site))
    }

    #[test]
    fn gap_blocks_until_predecessor_arrives() {
        let mut q = OrderingQueue::new();
        let only = sites(&[7]);
        q.insert(desc(5, 7, Some(4)));
        q.insert(desc(4, 7, Some(3)));
        assert_eq!(q.next_ready(&only, None), None);
        q.insert(desc(3, 7, None));
        assert_eq!(q.next_ready(&only, None), Some(t(3, 7)));
        q.pop(t(3, 7));
        assert_eq!(q.next_ready(&only, None), Some(t(4, 7)));
        q.pop(t(4, 7));
        assert_eq!(q.next_ready(&only, None), Some(t(5, 7)));
        q.pop(t(5, 7));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn other_initiators_must_vouch_for_the_head() {
        let mut q = OrderingQueue::new();
        let both = sites(&[7, 8]);
        q.insert(desc(10, 7, None));
        assert_eq!(q.next_ready(&both, None), None);

        // #8 promises nothing below 9: not enough for 10@7.
        q.observe_heartbeat(SiteId(8), t(9, 8), None);
        assert_eq!(q.next_ready(&both, None), None);

        q.observe_heartbeat(SiteId(8), t(12, 8), None);
        assert_eq!(q.next_ready(&both, None), Some(t(10, 7)));
    }

    #[test]
    fn heartbeat_holds_only_once_its_chain_arrived() {
        let mut q = OrderingQueue::new();
        let both = sites(&[7, 8]);
        q.insert(desc(10, 7, None));
        // #8 routed 6@8 here and promises nothing below 20, but 6@8 is
        // still in flight.
        q.observe_heartbeat(SiteId(8), t(20, 8), Some(t(6, 8)));
        assert_eq!(q.next_ready(&both, None), None);
        q.insert(desc(6, 8, None));
        assert_eq!(q.next_ready(&both, None), Some(t(6, 8)));
        q.pop(t(6, 8));
        assert_eq!(q.next_ready(&both, None), Some(t(10, 7)));
    }

    #[test]
    fn snapshot_covers_missing_predecessors() {
        let mut q = OrderingQueue::new();
        let only = sites(&[7]);
        q.set_snapshot_cutoff(t(50, 7));
        q.insert(desc(51, 7, Some(49)));
        assert_eq!(q.next_ready(&only, Some(t(50, 7))), Some(t(51, 7)));
    }

    #[test]
    fn pass_through_never_waits() {
        let mut q = OrderingQueue::new();
        let both = sites(&[7, 8]);
        q.set_snapshot_cutoff(t(50, 7));
        q.insert(desc(30, 7, Some(29)));
        assert_eq!(q.next_ready(&both, Some(t(50, 7))), Some(t(30, 7)));
    }

    #[test]
    fn forgotten_initiator_no_longer_blocks() {
        let mut q = OrderingQueue::new();
        q.insert(desc(10, 7, None));
        assert_eq!(q.next_ready(&sites(&[7, 8]), None), None);
        q.forget_initiator(SiteId(8));
        assert_eq!(q.next_ready(&sites(&[7]), None), Some(t(10, 7)));
    }
}
