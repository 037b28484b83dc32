// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [PartitionExecutor] is the only thing that touches a partition's data.
//! It owns the partition's [ExecutionEngine], its ordering queue and its
//! high-water mark, and it runs as one sequential loop over its inbox, so
//! none of those need locks.
//!
//! The protocol logic lives in [PartitionExecutor::handle], which takes one
//! envelope and returns the envelopes to send in reply. [PartitionExecutor::run]
//! is just the loop that feeds it from an inbox and hands its output to a
//! [Transport].

use crate::{
    queue::OrderingQueue, watermarks::HighWaterLEExt, Config, Decision, Descriptor, Dispatch,
    Envelope, Error, ExecutionEngine, HighWaterLE, Inbox, MembershipChange, Message, Outcome,
    PartitionId, Response, Role, SiteId, Snapshot, Transport, TxnId, TxnState,
};
use async_std::sync::Arc;
use futures::{
    channel::mpsc::UnboundedReceiver,
    future,
    stream::{self, StreamExt},
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

#[derive(Clone, Debug)]
struct Resolved {
    /// `None` for a pass-through.
    decision: Option<Decision>,
    /// Re-sent if the fragment shows up again.
    response: Option<Envelope>,
}

enum Phase {
    /// Rejoining: everything but the snapshot is held back.
    AwaitingSnapshot(Vec<Envelope>),
    Active,
}

enum Input {
    Envelope(Envelope),
    Membership(MembershipChange),
    Closed,
}

pub struct PartitionExecutor<E: ExecutionEngine> {
    site: SiteId,
    partition: PartitionId,
    engine: E,
    config: Config,
    phase: Phase,
    queue: OrderingQueue,
    high_water: HighWaterLE,

    /// Cutoff of the snapshot being caught up from. Cleared, for good, when
    /// the first txn above it is dispatched.
    recovery_cutoff: Option<TxnId>,

    /// Cutoff of the last installed snapshot; outlives recovery so late
    /// arrivals at or below it can be recognised as protocol violations.
    snapshot_cutoff: Option<TxnId>,

    /// Initiators whose ordering horizon gates execution here.
    initiators: BTreeSet<SiteId>,

    /// The participant fragment that ran and is waiting for its decision,
    /// with the response it produced. Nothing else runs until it resolves.
    awaiting: Option<(Descriptor, Envelope)>,

    /// Decisions that arrived before their fragment reached the head.
    early_decisions: BTreeMap<TxnId, Decision>,

    resolved: BTreeMap<TxnId, Resolved>,
    halted: bool,
}

impl<E: ExecutionEngine> PartitionExecutor<E> {
    pub fn new(
        site: SiteId,
        partition: PartitionId,
        engine: E,
        initiators: BTreeSet<SiteId>,
        config: Config,
    ) -> Self {
        PartitionExecutor {
            site,
            partition,
            engine,
            config,
            phase: Phase::Active,
            queue: OrderingQueue::new(),
            high_water: HighWaterLE::default(),
            recovery_cutoff: None,
            snapshot_cutoff: None,
            initiators,
            awaiting: None,
            early_decisions: BTreeMap::new(),
            resolved: BTreeMap::new(),
            halted: false,
        }
    }

    /// An executor for a replica coming back into the cluster. It holds
    /// every envelope it receives until a `RecoverySnapshot` arrives, then
    /// installs the snapshot and replays them in recovery mode.
    pub fn rejoining(
        site: SiteId,
        partition: PartitionId,
        engine: E,
        initiators: BTreeSet<SiteId>,
        config: Config,
    ) -> Self {
        let mut this = Self::new(site, partition, engine, initiators, config);
        this.phase = Phase::AwaitingSnapshot(Vec::new());
        this
    }

    /// Starts in recovery mode with `cutoff`, for an engine that already
    /// holds the state as of `cutoff`.
    pub fn with_recovery_cutoff(mut self, cutoff: TxnId) -> Self {
        self.begin_recovery(cutoff);
        self
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn high_water(&self) -> TxnId {
        self.high_water.txn_id()
    }

    pub fn recovery_cutoff(&self) -> Option<TxnId> {
        self.recovery_cutoff
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery_cutoff.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn awaiting_decision(&self) -> Option<TxnId> {
        self.awaiting.as_ref().map(|(d, _)| d.txn_id)
    }

    /// The finalized state of this replica and the txn it is current as of.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cutoff: self.high_water.txn_id(),
            state: self.engine.snapshot(),
        }
    }

    fn begin_recovery(&mut self, cutoff: TxnId) {
        info!(
            "partition {:?} at {:?} recovering from snapshot at {:?}",
            self.partition, self.site, cutoff
        );
        self.recovery_cutoff = Some(cutoff);
        self.snapshot_cutoff = Some(cutoff);
        self.queue.set_snapshot_cutoff(cutoff);
    }

    fn graduated(&self) -> bool {
        self.snapshot_cutoff.is_some() && self.recovery_cutoff.is_none()
    }

    fn fatal(&self, txn_id: TxnId, reason: &str) -> Error {
        Error::FatalInconsistency {
            txn_id,
            reason: reason.to_string(),
        }
    }

    fn check_live(&self) -> Result<(), Error> {
        if self.halted {
            Err(Error::Halted(self.partition))
        } else {
            Ok(())
        }
    }

    /// Runs `step`, halting the partition for good if it reports a fatal
    /// inconsistency.
    fn guarded<F>(&mut self, step: F) -> Result<Vec<Envelope>, Error>
    where
        F: FnOnce(&mut Self, &mut Vec<Envelope>) -> Result<(), Error>,
    {
        self.check_live()?;
        let mut out = Vec::new();
        match step(&mut *self, &mut out) {
            Ok(()) => Ok(out),
            Err(e) => {
                if e.is_fatal() {
                    error!(
                        "partition {:?} at {:?} halting: {}",
                        self.partition, self.site, e
                    );
                    self.halted = true;
                }
                Err(e)
            }
        }
    }

    /// Accepts a descriptor for this partition. Never waits: out-of-order
    /// descriptors are held until everything below them has resolved.
    /// Returns whatever became runnable as a result, already run.
    pub fn enqueue(&mut self, descriptor: Descriptor) -> Result<Vec<Envelope>, Error> {
        self.guarded(|this, out| {
            this.accept(descriptor, out)?;
            this.drain(out)
        })
    }

    /// Processes one envelope from the inbox and returns the envelopes to
    /// send in reply.
    pub fn handle(&mut self, envelope: Envelope) -> Result<Vec<Envelope>, Error> {
        self.guarded(|this, out| this.handle_(envelope, out))
    }

    /// Replaces the set of initiators whose horizons gate execution.
    pub fn set_initiators(
        &mut self,
        initiators: BTreeSet<SiteId>,
    ) -> Result<Vec<Envelope>, Error> {
        self.guarded(|this, out| {
            for gone in this.initiators.difference(&initiators) {
                debug!("no longer waiting on initiator {:?}", gone);
                this.queue.forget_initiator(*gone);
            }
            this.initiators = initiators;
            this.drain(out)
        })
    }

    fn handle_(&mut self, envelope: Envelope, out: &mut Vec<Envelope>) -> Result<(), Error> {
        if let Phase::AwaitingSnapshot(_) = self.phase {
            return self.install_or_defer(envelope, out);
        }
        let txn_id = envelope.txn_id;
        match &envelope.message {
            Message::Fragment(fragment) => {
                if fragment.partition != self.partition {
                    warn!(
                        "dropping fragment of {:?} for {:?}, misrouted to {:?}",
                        txn_id, fragment.partition, self.partition
                    );
                } else if let Some(descriptor) = Descriptor::from_fragment(&envelope) {
                    self.accept(descriptor, out)?;
                }
            }
            Message::Decision(decision) => {
                self.accept_decision(txn_id, envelope.source, *decision, out)?
            }
            Message::Heartbeat(hb) if hb.partition == self.partition => {
                self.queue
                    .observe_heartbeat(envelope.source, txn_id, hb.last_routed);
            }
            Message::RecoverySnapshot(_) if self.snapshot_cutoff == Some(txn_id) => {
                debug!("duplicate snapshot at {:?}", txn_id);
            }
            Message::RecoverySnapshot(_) => {
                return Err(self.fatal(txn_id, "snapshot delivered to an active partition"));
            }
            _ => warn!(
                "ignoring unexpected {:?} for {:?} from {:?}",
                envelope.kind(),
                txn_id,
                envelope.source
            ),
        }
        self.drain(out)
    }

    fn install_or_defer(&mut self, envelope: Envelope, out: &mut Vec<Envelope>) -> Result<(), Error> {
        let cutoff = envelope.txn_id;
        let state = match envelope.message {
            Message::RecoverySnapshot(state) => state,
            message => {
                let held = Envelope { message, ..envelope };
                trace!("deferring {:?} for {:?} until snapshot", held.kind(), held.txn_id);
                if let Phase::AwaitingSnapshot(deferred) = &mut self.phase {
                    deferred.push(held);
                }
                return Ok(());
            }
        };
        self.engine.install_snapshot(&state)?;
        let deferred = match std::mem::replace(&mut self.phase, Phase::Active) {
            Phase::AwaitingSnapshot(deferred) => deferred,
            Phase::Active => Vec::new(),
        };
        self.begin_recovery(cutoff);
        debug!("replaying {} deferred envelopes", deferred.len());
        for env in deferred {
            self.handle_(env, out)?;
        }
        self.drain(out)
    }

    fn accept(&mut self, mut descriptor: Descriptor, out: &mut Vec<Envelope>) -> Result<(), Error> {
        let txn_id = descriptor.txn_id;
        // Includes txns passed through before graduation.
        if let Some(done) = self.resolved.get(&txn_id) {
            debug!("duplicate fragment for resolved {:?}", txn_id);
            out.extend(done.response.clone());
            return Ok(());
        }
        if let (true, Some(cutoff)) = (self.graduated(), self.snapshot_cutoff) {
            if txn_id <= cutoff {
                return Err(self.fatal(txn_id, "descriptor at or below recovery cutoff after graduation"));
            }
        }
        if let Some((running, response)) = &self.awaiting {
            if running.txn_id == txn_id {
                debug!("duplicate fragment for running {:?}", txn_id);
                out.push(response.clone());
                return Ok(());
            }
        }
        if self.queue.contains(txn_id) {
            debug!("duplicate fragment for queued {:?}", txn_id);
            return Ok(());
        }
        let passing = self.recovery_cutoff.map_or(false, |s| txn_id <= s);
        if !passing && self.high_water.covers(txn_id) {
            // Chains keep anything new above the mark, so this is a
            // redelivery of a txn that has aged out of `resolved`.
            debug!("dropping stale duplicate of {:?}", txn_id);
            return Ok(());
        }
        descriptor.recovery_cutoff = self.recovery_cutoff;
        descriptor.transition(TxnState::Queued)?;
        self.queue.insert(descriptor);
        Ok(())
    }

    fn accept_decision(
        &mut self,
        txn_id: TxnId,
        source: SiteId,
        decision: Decision,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        if self.awaiting_decision() == Some(txn_id) {
            if let Some((descriptor, response)) = self.awaiting.take() {
                return self.finish(descriptor, response, decision, out);
            }
        }
        let ack = Envelope::new(txn_id, self.site, source, Message::DecisionAck(self.partition));
        if let Some(done) = self.resolved.get(&txn_id) {
            if done.decision.map_or(false, |d| d != decision) {
                return Err(self.fatal(txn_id, "decision contradicts the resolved outcome"));
            }
            debug!("re-acknowledging decision for {:?}", txn_id);
            out.push(ack);
            return Ok(());
        }
        if self.recovery_cutoff.map_or(false, |s| txn_id <= s) {
            debug!("decision for {:?} is covered by the snapshot", txn_id);
            out.push(ack);
            return Ok(());
        }
        if !self.queue.contains(txn_id) && self.high_water.covers(txn_id) {
            return Err(self.fatal(txn_id, "decision for an unknown txn"));
        }
        match self.early_decisions.insert(txn_id, decision) {
            Some(prior) if prior != decision => {
                Err(self.fatal(txn_id, "conflicting decisions"))
            }
            _ => {
                debug!("holding early {:?} for {:?}", decision, txn_id);
                Ok(())
            }
        }
    }

    /// Runs everything that is ready, in order, until the queue is empty,
    /// the head is waiting on a predecessor, or a participant fragment is
    /// waiting on its decision.
    fn drain(&mut self, out: &mut Vec<Envelope>) -> Result<(), Error> {
        while self.awaiting.is_none() {
            let next = match self.queue.next_ready(&self.initiators, self.recovery_cutoff) {
                Some(txn_id) => txn_id,
                None => break,
            };
            match self.queue.pop(next) {
                Some(descriptor) => self.dispatch(descriptor, out)?,
                None => break,
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, mut descriptor: Descriptor, out: &mut Vec<Envelope>) -> Result<(), Error> {
        let txn_id = descriptor.txn_id;
        if descriptor.dispatch_mode() == Dispatch::PassThrough {
            trace!("passing through {:?}", txn_id);
            descriptor.transition(TxnState::Done)?;
            // A single-partition initiator is told the txn is settled here,
            // so it stops re-sending; participants ack their decision.
            let settled = match descriptor.role {
                Role::ParticipantOf(_) => None,
                _ => Some(self.ack(&descriptor)),
            };
            out.extend(settled.clone());
            self.record(txn_id, None, settled);
            return Ok(());
        }
        if let Some(cutoff) = self.recovery_cutoff.take() {
            info!(
                "partition {:?} at {:?} leaving recovery: {:?} is past cutoff {:?}",
                self.partition, self.site, txn_id, cutoff
            );
        }

        let early = self.early_decisions.remove(&txn_id);
        let participant = matches!(descriptor.role, Role::ParticipantOf(_));
        if participant && early == Some(Decision::Rollback) {
            debug!("{:?} rolled back before it ran", txn_id);
            descriptor.transition(TxnState::RolledBack)?;
            out.push(self.ack(&descriptor));
            descriptor.transition(TxnState::Done)?;
            self.record(txn_id, Some(Decision::Rollback), None);
            return Ok(());
        }

        descriptor.transition(TxnState::Executing)?;
        let execution = self.engine.execute(txn_id, &descriptor.payload);
        let success = execution.outcome == Outcome::Committed;
        trace!("executed {:?}: {:?}", txn_id, execution.outcome);
        let response = Envelope::new(
            txn_id,
            self.site,
            descriptor.initiator,
            Message::Response(Response {
                partition: self.partition,
                success,
                result: execution.result,
            }),
        );

        if !participant {
            let decision = if success {
                Decision::Commit
            } else {
                Decision::Rollback
            };
            self.engine.finalize(txn_id, decision);
            descriptor.resolve_with(decision)?;
            out.push(response.clone());
            descriptor.transition(TxnState::Done)?;
            self.record(txn_id, Some(decision), Some(response));
            return Ok(());
        }

        descriptor.transition(TxnState::AwaitingDecision)?;
        out.push(response.clone());
        match early {
            Some(decision) => self.finish(descriptor, response, decision, out),
            None => {
                debug!("{:?} waiting for decision", txn_id);
                self.awaiting = Some((descriptor, response));
                Ok(())
            }
        }
    }

    fn finish(
        &mut self,
        mut descriptor: Descriptor,
        response: Envelope,
        decision: Decision,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        let txn_id = descriptor.txn_id;
        let succeeded = matches!(&response.message, Message::Response(r) if r.success);
        if decision == Decision::Commit && !succeeded {
            return Err(self.fatal(txn_id, "commit decided for a fragment this replica aborted"));
        }
        self.engine.finalize(txn_id, decision);
        descriptor.resolve_with(decision)?;
        debug!("{:?} finalized with {:?}", txn_id, decision);
        out.push(self.ack(&descriptor));
        descriptor.transition(TxnState::Done)?;
        self.record(txn_id, Some(decision), Some(response));
        Ok(())
    }

    fn ack(&self, descriptor: &Descriptor) -> Envelope {
        Envelope::new(
            descriptor.txn_id,
            self.site,
            descriptor.initiator,
            Message::DecisionAck(self.partition),
        )
    }

    fn record(&mut self, txn_id: TxnId, decision: Option<Decision>, response: Option<Envelope>) {
        self.high_water.advance_to(txn_id);
        self.resolved.insert(txn_id, Resolved { decision, response });
        while self.resolved.len() > self.config.resolved_window {
            match self.resolved.keys().next().copied() {
                Some(oldest) => self.resolved.remove(&oldest),
                None => break,
            };
        }
    }

    /// Serves this partition until its inbox closes, then hands back the
    /// engine. Returns early, with the error, if the partition halts.
    pub async fn run(
        mut self,
        inbox: Inbox,
        transport: Arc<dyn Transport>,
        changes: UnboundedReceiver<MembershipChange>,
    ) -> Result<E, Error> {
        let span = debug_span!("partition", site=?self.site, partition=?self.partition);
        async move {
            let inbox = inbox
                .map(Input::Envelope)
                .chain(stream::once(future::ready(Input::Closed)));
            let mut inputs = stream::select(inbox, changes.map(Input::Membership));
            while let Some(input) = inputs.next().await {
                let res = match input {
                    Input::Closed => break,
                    Input::Envelope(envelope) => self.handle(envelope),
                    Input::Membership(change) => self.set_initiators(change.initiators),
                };
                let out = match res {
                    Ok(out) => out,
                    Err(e) if self.halted => return Err(e),
                    Err(e) => {
                        warn!(
                            "partition {:?} at {:?} carrying on after: {}",
                            self.partition, self.site, e
                        );
                        continue;
                    }
                };
                for envelope in out {
                    transport.send(envelope).await;
                }
            }
            debug!("inbox closed with {} txns still queued", self.queue.len());
            Ok(self.engine)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fragment, MemoryEngine, MessageKind, ProcedureInvocation, Value};

    const INIT: SiteId = SiteId(100);
    const OTHER: SiteId = SiteId(200);
    const ME: SiteId = SiteId(1);
    const P0: PartitionId = PartitionId(0);

    fn t(clock: u64) -> TxnId {
        TxnId::new(clock, INIT)
    }

    fn executor() -> PartitionExecutor<MemoryEngine> {
        let initiators = std::iter::once(INIT).collect();
        PartitionExecutor::new(ME, P0, MemoryEngine::new(), initiators, Config::default())
    }

    fn add(n: u64) -> ProcedureInvocation {
        ProcedureInvocation::new("add", vec![Value::Text("x".into()), Value::Int(n as i64)])
    }

    fn fragment(clock: u64, prev: Option<u64>, parts: &[u32], invocation: ProcedureInvocation) -> Envelope {
        Envelope::new(
            t(clock),
            INIT,
            ME,
            Message::Fragment(Fragment {
                partition: P0,
                invocation,
                involved: parts.iter().map(|p| PartitionId(*p)).collect(),
                prev: prev.map(t),
            }),
        )
    }

    fn sp(clock: u64, prev: Option<u64>) -> Envelope {
        fragment(clock, prev, &[0], add(clock))
    }

    fn mp(clock: u64, prev: Option<u64>) -> Envelope {
        fragment(clock, prev, &[0, 1], add(clock))
    }

    fn decision(clock: u64, d: Decision) -> Envelope {
        Envelope::new(t(clock), INIT, ME, Message::Decision(d))
    }

    fn kinds(out: &[Envelope]) -> Vec<MessageKind> {
        out.iter().map(|e| e.kind()).collect()
    }

    fn fatal(res: Result<Vec<Envelope>, Error>) -> bool {
        matches!(res, Err(Error::FatalInconsistency { .. }))
    }

    #[test]
    fn executes_in_txn_order_whatever_the_arrival_order() {
        let mut x = executor();
        assert!(x.handle(sp(5, Some(4))).expect("5").is_empty());
        assert_eq!(kinds(&x.handle(sp(3, None)).expect("3")), vec![MessageKind::Response]);
        assert_eq!(x.engine().executed(), &[t(3)]);
        assert_eq!(x.handle(sp(4, Some(3))).expect("4").len(), 2);
        assert_eq!(x.engine().executed(), &[t(3), t(4), t(5)]);
        assert_eq!(x.high_water(), t(5));
        assert_eq!(x.queued(), 0);
    }

    #[test]
    fn every_permutation_reaches_the_same_state() {
        let orders: [[u64; 3]; 6] = [
            [3, 4, 5],
            [3, 5, 4],
            [4, 3, 5],
            [4, 5, 3],
            [5, 3, 4],
            [5, 4, 3],
        ];
        for order in orders.iter() {
            let mut x = executor();
            for clock in order.iter() {
                let prev = if *clock == 3 { None } else { Some(clock - 1) };
                x.handle(sp(*clock, prev)).expect("handle");
            }
            assert_eq!(x.engine().executed(), &[t(3), t(4), t(5)]);
            assert_eq!(x.engine().get("x"), Some(12));
            assert_eq!(x.high_water(), t(5));
        }
    }

    #[test]
    fn participant_blocks_partition_until_decision() {
        let mut x = executor();
        let out = x.handle(mp(1, None)).expect("mp");
        assert_eq!(kinds(&out), vec![MessageKind::Response]);
        assert_eq!(x.awaiting_decision(), Some(t(1)));

        assert!(x.handle(sp(2, Some(1))).expect("sp").is_empty());
        assert_eq!(x.engine().executed(), &[t(1)]);

        let out = x.handle(decision(1, Decision::Commit)).expect("decision");
        assert_eq!(kinds(&out), vec![MessageKind::DecisionAck, MessageKind::Response]);
        assert_eq!(x.engine().executed(), &[t(1), t(2)]);
        assert_eq!(x.engine().get("x"), Some(3));
        assert_eq!(x.awaiting_decision(), None);
    }

    #[test]
    fn rollback_discards_participant_effects() {
        let mut x = executor();
        x.handle(mp(1, None)).expect("mp");
        assert_eq!(x.engine().get("x"), Some(1));
        x.handle(decision(1, Decision::Rollback)).expect("decision");
        assert_eq!(x.engine().get("x"), None);
        assert_eq!(x.engine().finalized(), &[(t(1), Decision::Rollback)]);
        assert_eq!(x.high_water(), t(1));
    }

    #[test]
    fn early_rollback_skips_execution() {
        let mut x = executor();
        assert!(x.handle(decision(2, Decision::Rollback)).expect("early").is_empty());
        let out = x.handle(mp(2, None)).expect("mp");
        assert_eq!(kinds(&out), vec![MessageKind::DecisionAck]);
        assert!(x.engine().executed().is_empty());
        assert_eq!(x.high_water(), t(2));
    }

    #[test]
    fn early_commit_executes_and_finalizes_at_once() {
        let mut x = executor();
        x.handle(decision(2, Decision::Commit)).expect("early");
        let out = x.handle(mp(2, None)).expect("mp");
        assert_eq!(kinds(&out), vec![MessageKind::Response, MessageKind::DecisionAck]);
        assert_eq!(x.awaiting_decision(), None);
        assert_eq!(x.engine().finalized(), &[(t(2), Decision::Commit)]);
    }

    #[test]
    fn commit_of_a_locally_aborted_fragment_halts() {
        let mut x = executor();
        x.handle(decision(2, Decision::Commit)).expect("early");
        let abort = fragment(2, None, &[0, 1], ProcedureInvocation::new("abort", vec![]));
        assert!(fatal(x.handle(abort)));
        assert!(x.is_halted());
        assert_eq!(x.handle(sp(3, Some(2))), Err(Error::Halted(P0)));
    }

    #[test]
    fn duplicates_are_answered_not_rerun() {
        let mut x = executor();
        let first = x.handle(sp(1, None)).expect("sp");
        assert_eq!(x.handle(sp(1, None)).expect("dup"), first);

        let first = x.handle(mp(2, Some(1))).expect("mp");
        assert_eq!(x.handle(mp(2, Some(1))).expect("dup"), first);

        let ack = x.handle(decision(2, Decision::Commit)).expect("decision");
        assert_eq!(x.handle(decision(2, Decision::Commit)).expect("dup"), ack);
        assert_eq!(x.engine().executed(), &[t(1), t(2)]);

        assert!(fatal(x.handle(decision(2, Decision::Rollback))));
    }

    #[test]
    fn queued_duplicates_are_dropped() {
        let mut x = executor();
        x.handle(sp(5, Some(4))).expect("5");
        x.handle(sp(5, Some(4))).expect("dup");
        assert_eq!(x.queued(), 1);
    }

    #[test]
    fn decision_for_unknown_txn_below_high_water_halts() {
        let mut x = executor();
        x.handle(sp(5, None)).expect("sp");
        assert!(fatal(x.handle(decision(3, Decision::Commit))));
        assert!(x.is_halted());
    }

    #[test]
    fn duplicates_older_than_the_window_are_dropped() {
        let initiators = std::iter::once(INIT).collect();
        let config = Config::default().with_resolved_window(2);
        let mut x = PartitionExecutor::new(ME, P0, MemoryEngine::new(), initiators, config);
        x.handle(sp(1, None)).expect("1");
        x.handle(sp(2, Some(1))).expect("2");
        x.handle(sp(3, Some(2))).expect("3");
        assert!(x.handle(sp(1, None)).expect("stale").is_empty());
        assert!(!x.is_halted());
        assert_eq!(x.engine().executed(), &[t(1), t(2), t(3)]);
        assert_eq!(x.engine().get("x"), Some(6));
    }

    #[test]
    fn recovery_passes_through_then_graduates() {
        let mut x = executor().with_recovery_cutoff(t(50));
        assert!(x.is_recovering());

        let out = x.handle(sp(30, Some(29))).expect("30");
        assert_eq!(kinds(&out), vec![MessageKind::DecisionAck]);
        assert!(x.engine().executed().is_empty());
        assert_eq!(x.high_water(), t(30));
        assert!(x.is_recovering());

        let out = x.handle(sp(51, Some(30))).expect("51");
        assert_eq!(kinds(&out), vec![MessageKind::Response]);
        assert_eq!(x.engine().executed(), &[t(51)]);
        assert!(!x.is_recovering());

        assert!(fatal(x.handle(sp(40, Some(39)))));
        assert!(x.is_halted());
    }

    #[test]
    fn recovery_treats_participants_like_anything_else() {
        let mut x = executor().with_recovery_cutoff(t(50));
        assert!(x.handle(mp(40, None)).expect("mp").is_empty());
        assert_eq!(x.awaiting_decision(), None);
        let out = x.handle(decision(40, Decision::Commit)).expect("decision");
        assert_eq!(kinds(&out), vec![MessageKind::DecisionAck]);
        assert!(x.engine().executed().is_empty());
    }

    #[test]
    fn passed_through_txns_may_be_redelivered_after_graduation() {
        let mut x = executor().with_recovery_cutoff(t(10));
        assert!(x.handle(mp(10, None)).expect("mp").is_empty());
        let out = x.handle(sp(11, Some(10))).expect("sp");
        assert_eq!(kinds(&out), vec![MessageKind::Response]);
        assert!(!x.is_recovering());

        // The coordinator of 10 is still broadcasting its decision.
        assert!(x.handle(mp(10, None)).expect("again").is_empty());
        let out = x.handle(decision(10, Decision::Commit)).expect("decision");
        assert_eq!(kinds(&out), vec![MessageKind::DecisionAck]);
        assert!(!x.is_halted());
        assert_eq!(x.engine().executed(), &[t(11)]);

        // Never seen here, so not a redelivery.
        assert!(fatal(x.handle(sp(9, None))));
    }

    #[test]
    fn catching_up_matches_a_replica_that_never_left() {
        let stream: Vec<Envelope> = (1..=6)
            .map(|n| sp(n, if n == 1 { None } else { Some(n - 1) }))
            .collect();

        let mut live = executor();
        for env in &stream[..3] {
            live.handle(env.clone()).expect("live");
        }
        let snap = live.snapshot();
        assert_eq!(snap.cutoff, t(3));
        for env in &stream[3..] {
            live.handle(env.clone()).expect("live");
        }

        let initiators = std::iter::once(INIT).collect();
        let mut back =
            PartitionExecutor::rejoining(SiteId(2), P0, MemoryEngine::new(), initiators, Config::default());
        for env in stream.iter().skip(1) {
            assert!(back.handle(env.clone()).expect("deferred").is_empty());
        }
        assert_eq!(back.queued(), 0);

        let install = Envelope::new(snap.cutoff, ME, SiteId(2), Message::RecoverySnapshot(snap.state.clone()));
        back.handle(install.clone()).expect("install");
        assert!(!back.is_recovering());
        assert_eq!(back.engine().executed(), &[t(4), t(5), t(6)]);
        assert_eq!(back.engine().data(), live.engine().data());
        assert_eq!(back.high_water(), live.high_water());

        // The same snapshot again is harmless; a different one is not.
        assert!(back.handle(install).expect("again").is_empty());
        let other = Envelope::new(t(5), ME, SiteId(2), Message::RecoverySnapshot(snap.state));
        assert!(fatal(back.handle(other)));
    }

    #[test]
    fn other_initiators_gate_execution() {
        let initiators = vec![INIT, OTHER].into_iter().collect();
        let mut x = PartitionExecutor::new(ME, P0, MemoryEngine::new(), initiators, Config::default());
        assert!(x.handle(sp(5, None)).expect("sp").is_empty());

        let hb = |clock: u64| {
            Envelope::new(
                TxnId::new(clock, OTHER),
                OTHER,
                ME,
                Message::Heartbeat(crate::Heartbeat {
                    partition: P0,
                    last_routed: None,
                }),
            )
        };
        assert_eq!(x.handle(hb(6)).expect("heartbeat").len(), 1);

        assert!(x.handle(sp(7, Some(5))).expect("sp").is_empty());
        let out = x.set_initiators(std::iter::once(INIT).collect()).expect("membership");
        assert_eq!(out.len(), 1);
        assert_eq!(x.engine().executed(), &[t(5), t(7)]);
    }

    #[test]
    fn run_survives_an_undecodable_snapshot() {
        use crate::{Network, Transport};
        use futures::channel::mpsc;

        async_std::task::block_on(async {
            let net = Network::new();
            let inbox = net.register(ME, 16).await;
            let (_changes, changes_rx) = mpsc::unbounded();
            let initiators = std::iter::once(INIT).collect();
            let x = PartitionExecutor::rejoining(ME, P0, MemoryEngine::new(), initiators, Config::default());
            let running = async_std::task::spawn(x.run(inbox, Arc::new(net.clone()), changes_rx));

            let garbage = vec![0xff, 0xfe];
            net.send(Envelope::new(t(2), SiteId(2), ME, Message::RecoverySnapshot(garbage)))
                .await;
            let good = b"x\t3\n".to_vec();
            net.send(Envelope::new(t(2), SiteId(2), ME, Message::RecoverySnapshot(good)))
                .await;
            net.send(sp(3, Some(2))).await;
            async_std::task::sleep(std::time::Duration::from_millis(50)).await;
            net.shutdown().await;

            let engine = running.await.expect("still serving");
            assert_eq!(engine.get("x"), Some(6));
            assert_eq!(engine.executed(), &[t(3)]);
        });
    }
}
