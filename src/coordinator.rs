// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The initiator's side of one transaction. A [Coordination] fans the
//! transaction's fragments out to every replica of every involved
//! partition, collects one [Response] per partition, decides, broadcasts the
//! decision and collects acknowledgements. It is pure bookkeeping: it never
//! waits or sends anything itself. The initiator drives it and owns the
//! timeouts.
//!
//! A single-partition transaction goes through the same phases here, but
//! its partition finalizes on its own, so there is no decision to broadcast.
//! Its fragment is still re-sent to every replica that has not answered,
//! since a replica missing one txn would stall on the next one's chain.

use crate::{
    Decision, Descriptor, Envelope, Error, Fragment, Message, PartitionId, PartitionMap,
    ProcedureInvocation, Response, SiteId, TxnId, TxnState, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, trace, warn};

/// What a client gets back: the decision, and each partition's result.
/// A logical abort is a normal `Rollback` outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnOutcome {
    pub txn_id: TxnId,
    pub decision: Decision,
    pub results: BTreeMap<PartitionId, Vec<Value>>,
}

impl TxnOutcome {
    pub fn committed(&self) -> bool {
        self.decision == Decision::Commit
    }
}

pub(crate) struct Coordination {
    site: SiteId,
    descriptor: Descriptor,
    fragments: BTreeMap<PartitionId, Fragment>,
    sent_to: BTreeMap<PartitionId, BTreeSet<SiteId>>,
    responses: BTreeMap<PartitionId, Response>,
    responded: BTreeSet<(PartitionId, SiteId)>,
    diverged: bool,
    decision: Option<Decision>,
    unacked: BTreeSet<(PartitionId, SiteId)>,
}

impl Coordination {
    /// `prevs` gives, per involved partition, the txn this initiator routed
    /// there just before this one.
    pub(crate) fn new(
        site: SiteId,
        txn_id: TxnId,
        invocation: ProcedureInvocation,
        prevs: BTreeMap<PartitionId, Option<TxnId>>,
    ) -> Self {
        let involved: BTreeSet<PartitionId> = prevs.keys().copied().collect();
        let fragments = prevs
            .iter()
            .map(|(p, prev)| {
                let fragment = Fragment {
                    partition: *p,
                    invocation: invocation.clone(),
                    involved: involved.clone(),
                    prev: *prev,
                };
                (*p, fragment)
            })
            .collect();
        Coordination {
            site,
            descriptor: Descriptor::coordinator(txn_id, site, involved, invocation),
            fragments,
            sent_to: BTreeMap::new(),
            responses: BTreeMap::new(),
            responded: BTreeSet::new(),
            diverged: false,
            decision: None,
            unacked: BTreeSet::new(),
        }
    }

    pub(crate) fn txn_id(&self) -> TxnId {
        self.descriptor.txn_id
    }

    pub(crate) fn state(&self) -> TxnState {
        self.descriptor.state()
    }

    pub(crate) fn is_multi_partition(&self) -> bool {
        self.descriptor.is_multi_partition()
    }

    fn fragment_to(&mut self, partition: PartitionId, site: SiteId) -> Option<Envelope> {
        let fragment = self.fragments.get(&partition)?.clone();
        self.sent_to.entry(partition).or_default().insert(site);
        Some(Envelope::new(
            self.txn_id(),
            self.site,
            site,
            Message::Fragment(fragment),
        ))
    }

    fn fragments_to(
        &mut self,
        partitions: &[PartitionId],
        map: &PartitionMap,
    ) -> Result<Vec<Envelope>, Error> {
        let mut out = Vec::new();
        for p in partitions {
            let replicas = map.get(p).cloned().unwrap_or_default();
            if replicas.is_empty() {
                return Err(Error::ParticipantUnavailable {
                    txn_id: self.txn_id(),
                    partition: *p,
                });
            }
            for site in replicas {
                out.extend(self.fragment_to(*p, site));
            }
        }
        Ok(out)
    }

    /// Fragments for every replica of every involved partition.
    pub(crate) fn start(&mut self, map: &PartitionMap) -> Result<Vec<Envelope>, Error> {
        self.descriptor.transition(TxnState::CollectingResponses)?;
        let all: Vec<PartitionId> = self.fragments.keys().copied().collect();
        self.fragments_to(&all, map)
    }

    pub(crate) fn on_response(&mut self, source: SiteId, response: Response) {
        let partition = response.partition;
        if !self.fragments.contains_key(&partition) {
            warn!("response for {:?} from uninvolved {:?}", self.txn_id(), partition);
            return;
        }
        self.responded.insert((partition, source));
        if !self.is_multi_partition() {
            self.unacked.remove(&(partition, source));
        }
        match self.responses.get(&partition) {
            Some(first) if first.success != response.success => {
                error!(
                    "replicas of {:?} diverged on {:?}: {:?} says success={}",
                    partition,
                    self.txn_id(),
                    source,
                    response.success
                );
                self.diverged = true;
            }
            Some(_) => trace!("redundant response from {:?}", source),
            None => {
                trace!("response from {:?} for {:?}", source, partition);
                self.responses.insert(partition, response);
            }
        }
    }

    pub(crate) fn missing(&self) -> Vec<PartitionId> {
        self.fragments
            .keys()
            .filter(|p| !self.responses.contains_key(*p))
            .copied()
            .collect()
    }

    pub(crate) fn has_all_responses(&self) -> bool {
        self.responses.len() == self.fragments.len()
    }

    /// Re-sends the fragment of every silent partition to its replicas in
    /// the current map. A replica that already ran it answers again from
    /// its cache. Fails if some silent partition has no replica left.
    pub(crate) fn fail_over(&mut self, map: &PartitionMap) -> Result<Vec<Envelope>, Error> {
        let missing = self.missing();
        debug!("{:?} failing over {:?}", self.txn_id(), missing);
        self.fragments_to(&missing, map)
    }

    fn conclude(&mut self, decision: Decision) -> Result<Decision, Error> {
        self.descriptor.transition(TxnState::Deciding)?;
        self.descriptor.transition(TxnState::BroadcastingDecision)?;
        self.decision = Some(decision);
        if self.descriptor.is_multi_partition() {
            for (p, sites) in &self.sent_to {
                for s in sites {
                    self.unacked.insert((*p, *s));
                }
            }
        }
        debug!("{:?} decided {:?}", self.txn_id(), decision);
        Ok(decision)
    }

    /// Commit only if every partition succeeded and no replicas disagreed.
    pub(crate) fn decide(&mut self) -> Result<Decision, Error> {
        let all_succeeded =
            self.has_all_responses() && self.responses.values().all(|r| r.success);
        let decision = if all_succeeded && !self.diverged {
            self.conclude(Decision::Commit)?
        } else {
            self.conclude(Decision::Rollback)?
        };
        if !self.is_multi_partition() {
            for (p, sites) in &self.sent_to {
                for s in sites {
                    if !self.responded.contains(&(*p, *s)) {
                        self.unacked.insert((*p, *s));
                    }
                }
            }
        }
        Ok(decision)
    }

    /// Rolls back without waiting for the rest of the responses.
    pub(crate) fn abandon(&mut self) -> Result<Decision, Error> {
        self.conclude(Decision::Rollback)
    }

    /// For every site that has yet to acknowledge: the fragment, if the site
    /// never answered it, and the decision, if there is one to broadcast.
    pub(crate) fn decision_envelopes(&mut self) -> Vec<Envelope> {
        let decision = match self.decision {
            Some(d) => d,
            None => return Vec::new(),
        };
        let broadcast = self.is_multi_partition();
        let pending: Vec<(PartitionId, SiteId)> = self.unacked.iter().copied().collect();
        let mut out = Vec::new();
        for (p, site) in pending {
            if !self.responded.contains(&(p, site)) {
                out.extend(self.fragment_to(p, site));
            }
            if broadcast {
                out.push(Envelope::new(
                    self.txn_id(),
                    self.site,
                    site,
                    Message::Decision(decision),
                ));
            }
        }
        out
    }

    pub(crate) fn on_ack(&mut self, source: SiteId, partition: PartitionId) {
        if !self.unacked.remove(&(partition, source)) {
            trace!("redundant ack from {:?} for {:?}", source, partition);
        }
    }

    /// Stops waiting on sites that have left the partition map.
    pub(crate) fn retain_live(&mut self, map: &PartitionMap) {
        self.unacked.retain(|(p, s)| {
            let live = map.get(p).map_or(false, |replicas| replicas.contains(s));
            if !live {
                debug!("no longer waiting on {:?} for {:?}", s, p);
            }
            live
        });
    }

    pub(crate) fn is_acknowledged(&self) -> bool {
        self.unacked.is_empty()
    }

    pub(crate) fn finish(mut self) -> Result<TxnOutcome, Error> {
        let decision = self.decision.unwrap_or(Decision::Rollback);
        self.descriptor.resolve_with(decision)?;
        self.descriptor.transition(TxnState::Done)?;
        Ok(TxnOutcome {
            txn_id: self.txn_id(),
            decision,
            results: self
                .responses
                .into_iter()
                .map(|(p, r)| (p, r.result))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageKind;

    const ME: SiteId = SiteId(100);

    fn kinds(out: &[Envelope]) -> Vec<MessageKind> {
        out.iter().map(|e| e.kind()).collect()
    }

    fn p(n: u32) -> PartitionId {
        PartitionId(n)
    }

    fn map(entries: &[(u32, &[u64])]) -> PartitionMap {
        entries
            .iter()
            .map(|(n, sites)| (p(*n), sites.iter().map(|s| SiteId(*s)).collect()))
            .collect()
    }

    fn coordination(parts: &[u32]) -> Coordination {
        let prevs = parts.iter().map(|n| (p(*n), None)).collect();
        Coordination::new(
            ME,
            TxnId::new(7, ME),
            ProcedureInvocation::new("add", vec![]),
            prevs,
        )
    }

    fn response(n: u32, success: bool) -> Response {
        Response {
            partition: p(n),
            success,
            result: vec![Value::Int(n as i64)],
        }
    }

    #[test]
    fn fans_out_to_every_replica() {
        let mut c = coordination(&[0, 1]);
        let out = c.start(&map(&[(0, &[1, 2]), (1, &[3])])).expect("start");
        let dests: BTreeSet<SiteId> = out.iter().map(|e| e.destination).collect();
        assert_eq!(dests, vec![SiteId(1), SiteId(2), SiteId(3)].into_iter().collect());
        assert_eq!(c.state(), TxnState::CollectingResponses);
    }

    #[test]
    fn commits_only_when_all_succeed() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1]), (1, &[2])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        assert_eq!(c.missing(), vec![p(1)]);
        c.on_response(SiteId(2), response(1, true));
        assert_eq!(c.decide(), Ok(Decision::Commit));

        let mut d = coordination(&[0, 1]);
        d.start(&map(&[(0, &[1]), (1, &[2])])).expect("start");
        d.on_response(SiteId(1), response(0, true));
        d.on_response(SiteId(2), response(1, false));
        assert_eq!(d.decide(), Ok(Decision::Rollback));
    }

    #[test]
    fn duplicate_responses_and_acks_are_ignored() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1, 2]), (1, &[3])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        c.on_response(SiteId(1), response(0, true));
        c.on_response(SiteId(2), response(0, true));
        c.on_response(SiteId(3), response(1, true));
        assert_eq!(c.decide(), Ok(Decision::Commit));
        // Everyone answered, so only the decision goes out.
        assert_eq!(kinds(&c.decision_envelopes()), vec![MessageKind::Decision; 3]);

        c.on_ack(SiteId(1), p(0));
        c.on_ack(SiteId(1), p(0));
        c.on_ack(SiteId(3), p(1));
        assert!(!c.is_acknowledged());
        c.on_ack(SiteId(2), p(0));
        assert!(c.is_acknowledged());

        let outcome = c.finish().expect("finish");
        assert!(outcome.committed());
        assert_eq!(outcome.results[&p(1)], vec![Value::Int(1)]);
    }

    #[test]
    fn divergent_replicas_force_rollback() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1, 2]), (1, &[3])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        c.on_response(SiteId(2), response(0, false));
        c.on_response(SiteId(3), response(1, true));
        assert_eq!(c.decide(), Ok(Decision::Rollback));
    }

    #[test]
    fn fail_over_resends_to_surviving_replicas() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1, 2]), (1, &[3])])).expect("start");
        c.on_response(SiteId(3), response(1, true));
        let out = c.fail_over(&map(&[(0, &[2]), (1, &[3])])).expect("fail over");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, SiteId(2));
        assert_eq!(out[0].kind(), MessageKind::Fragment);
    }

    #[test]
    fn fail_over_without_replicas_is_an_error() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1]), (1, &[3])])).expect("start");
        c.on_response(SiteId(3), response(1, true));
        let err = c.fail_over(&map(&[(0, &[]), (1, &[3])])).unwrap_err();
        assert_eq!(
            err,
            Error::ParticipantUnavailable {
                txn_id: TxnId::new(7, ME),
                partition: p(0)
            }
        );
        assert_eq!(c.abandon(), Ok(Decision::Rollback));
        // #1 never answered and gets its fragment again; #3 did.
        assert_eq!(
            kinds(&c.decision_envelopes()),
            vec![MessageKind::Fragment, MessageKind::Decision, MessageKind::Decision]
        );
    }

    #[test]
    fn departed_sites_are_not_waited_for() {
        let mut c = coordination(&[0, 1]);
        c.start(&map(&[(0, &[1, 2]), (1, &[3])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        c.on_response(SiteId(3), response(1, true));
        c.decide().expect("decide");
        c.on_ack(SiteId(1), p(0));
        c.on_ack(SiteId(3), p(1));
        assert!(!c.is_acknowledged());
        c.retain_live(&map(&[(0, &[1]), (1, &[3])]));
        assert!(c.is_acknowledged());
    }

    #[test]
    fn single_partition_has_nothing_to_broadcast() {
        let mut c = coordination(&[0]);
        c.start(&map(&[(0, &[1])])).expect("start");
        c.on_response(SiteId(1), response(0, false));
        assert_eq!(c.decide(), Ok(Decision::Rollback));
        assert!(c.decision_envelopes().is_empty());
        assert!(c.is_acknowledged());
        assert!(!c.finish().expect("finish").committed());
    }

    #[test]
    fn single_partition_fragment_is_resent_to_silent_replicas() {
        let mut c = coordination(&[0]);
        c.start(&map(&[(0, &[1, 2])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        assert_eq!(c.decide(), Ok(Decision::Commit));
        assert!(!c.is_acknowledged());

        let out = c.decision_envelopes();
        assert_eq!(kinds(&out), vec![MessageKind::Fragment]);
        assert_eq!(out[0].destination, SiteId(2));

        c.on_response(SiteId(2), response(0, true));
        assert!(c.is_acknowledged());
        assert!(c.decision_envelopes().is_empty());
    }

    #[test]
    fn single_partition_settled_by_pass_through_ack() {
        let mut c = coordination(&[0]);
        c.start(&map(&[(0, &[1, 2])])).expect("start");
        c.on_response(SiteId(1), response(0, true));
        c.decide().expect("decide");
        c.on_ack(SiteId(2), p(0));
        assert!(c.is_acknowledged());
    }
}
