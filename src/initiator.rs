// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An [Initiator] is the site a client talks to. It assigns each invocation
//! its [TxnId], routes fragments to partition replicas and coordinates
//! multi-partition transactions to a decision. It also sends the periodic
//! heartbeats that let partitions shared with other initiators make
//! progress while this one is idle.

use crate::{
    coordinator::Coordination, Clock, Config, Envelope, Error, Heartbeat, IdAllocator, Inbox,
    Membership, Message, PartitionId, PartitionMap, ProcedureInvocation, SiteId, Transport, TxnId, TxnOutcome,
};
use async_std::{
    future::timeout,
    sync::{Arc, Mutex},
    task,
};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    future::BoxFuture,
    FutureExt, StreamExt,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Id allocation and per-partition routing history. Both change together
/// under one lock, so a heartbeat's horizon is never below an id that was
/// allocated but not yet recorded as routed.
struct Routing {
    allocator: IdAllocator,
    last_routed: HashMap<PartitionId, TxnId>,
}

#[derive(Clone)]
pub struct Initiator {
    site: SiteId,
    routing: Arc<Mutex<Routing>>,
    /// Where to forward envelopes for each transaction in flight.
    calls: Arc<Mutex<HashMap<TxnId, UnboundedSender<Envelope>>>>,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    config: Config,
    running: Arc<AtomicBool>,
}

impl Initiator {
    pub fn new(
        site: SiteId,
        clock: Box<dyn Clock>,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        config: Config,
    ) -> Self {
        Initiator {
            site,
            routing: Arc::new(Mutex::new(Routing {
                allocator: IdAllocator::new(site, clock),
                last_routed: HashMap::new(),
            })),
            calls: Arc::new(Mutex::new(HashMap::new())),
            transport,
            membership,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Spawns the tasks that route incoming envelopes to their calls and
    /// send heartbeats. Both stop when `inbox` closes; calls still in flight
    /// then fail with [Error::Shutdown].
    pub fn launch_workers(&self, inbox: Inbox) {
        let this = self.clone();
        let span = debug_span!("initiator", site=?self.site);
        task::spawn(async move { this.route_incoming(inbox).await }.instrument(span.clone()));
        let this = self.clone();
        task::spawn(async move { this.send_heartbeats().await }.instrument(span));
    }

    async fn route_incoming(&self, mut inbox: Inbox) {
        while let Some(env) = inbox.next().await {
            let call = self.calls.lock().await.get(&env.txn_id).cloned();
            match call {
                Some(call) => {
                    let _ = call.unbounded_send(env);
                }
                None => trace!(
                    "no call in flight for {:?} from {:?}",
                    env.kind(),
                    env.source
                ),
            }
        }
        debug!("inbox closed, failing calls in flight");
        self.running.store(false, Ordering::SeqCst);
        self.calls.lock().await.clear();
    }

    async fn send_heartbeats(&self) {
        while self.running.load(Ordering::SeqCst) {
            task::sleep(self.config.heartbeat_interval).await;
            self.heartbeat().await;
        }
    }

    /// Tells every partition replica what this initiator last routed to it,
    /// and fences off every id up to now.
    pub fn heartbeat(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let map = this.membership.current_partition_map().await;
            let mut out = Vec::new();
            {
                let mut routing = this.routing.lock().await;
                let horizon = routing.allocator.next_id();
                for (partition, replicas) in &map {
                    let hb = Heartbeat {
                        partition: *partition,
                        last_routed: routing.last_routed.get(partition).copied(),
                    };
                    for site in replicas {
                        out.push(Envelope::new(
                            horizon,
                            this.site,
                            *site,
                            Message::Heartbeat(hb.clone()),
                        ));
                    }
                }
            }
            for env in out {
                this.transport.send(env).await;
            }
        }
        .boxed()
    }

    /// Runs `invocation` as one transaction over `partitions`, applying the
    /// same invocation at each. A logical abort comes back as an `Ok`
    /// outcome with [crate::Decision::Rollback]; an `Err` means the
    /// transaction could not be carried out at all.
    pub fn invoke(
        &self,
        invocation: ProcedureInvocation,
        partitions: BTreeSet<PartitionId>,
    ) -> BoxFuture<'static, Result<TxnOutcome, Error>> {
        let this = self.clone();
        async move { this.invoke_(invocation, partitions).await }.boxed()
    }

    async fn invoke_(
        &self,
        invocation: ProcedureInvocation,
        partitions: BTreeSet<PartitionId>,
    ) -> Result<TxnOutcome, Error> {
        if partitions.is_empty() {
            return Err(Error::EmptyInvocation);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let map = self.membership.current_partition_map().await;
        if let Some(p) = partitions
            .iter()
            .find(|p| map.get(*p).map_or(true, |r| r.is_empty()))
        {
            // Nothing was routed yet, so no partition sees a gap.
            return Err(Error::ParticipantUnavailable {
                txn_id: TxnId::zero_for(self.site),
                partition: *p,
            });
        }

        let (send, recv) = mpsc::unbounded();
        let (txn_id, prevs) = {
            let mut routing = self.routing.lock().await;
            let txn_id = routing.allocator.next_id();
            let prevs: BTreeMap<PartitionId, Option<TxnId>> = partitions
                .iter()
                .map(|p| (*p, routing.last_routed.insert(*p, txn_id)))
                .collect();
            self.calls.lock().await.insert(txn_id, send);
            (txn_id, prevs)
        };

        let span = debug_span!("txn", id=?txn_id);
        let coordination = Coordination::new(self.site, txn_id, invocation, prevs);
        let res = self
            .coordinate(coordination, &map, recv)
            .instrument(span)
            .await;
        self.calls.lock().await.remove(&txn_id);
        res
    }

    async fn send_all(&self, envelopes: Vec<Envelope>) {
        for env in envelopes {
            self.transport.send(env).await;
        }
    }

    async fn coordinate(
        &self,
        mut c: Coordination,
        map: &PartitionMap,
        mut incoming: UnboundedReceiver<Envelope>,
    ) -> Result<TxnOutcome, Error> {
        let out = c.start(map)?;
        self.send_all(out).await;

        let mut failure = None;
        let mut rounds = 0;
        while !c.has_all_responses() {
            match timeout(self.config.response_timeout, incoming.next()).await {
                Ok(Some(env)) => self.absorb(&mut c, env),
                Ok(None) => return Err(Error::Shutdown),
                Err(_) => {
                    rounds += 1;
                    let map = self.membership.current_partition_map().await;
                    // A single-partition txn may already have run, and
                    // nothing would undo it, so it is only given up on once
                    // a partition has no replica left.
                    let exhausted = rounds > self.config.max_failover_rounds;
                    let attempt = if exhausted && c.is_multi_partition() {
                        Err(Error::ParticipantUnavailable {
                            txn_id: c.txn_id(),
                            partition: c.missing().first().copied().unwrap_or_default(),
                        })
                    } else {
                        c.fail_over(&map)
                    };
                    match attempt {
                        Ok(out) => self.send_all(out).await,
                        Err(e) => {
                            warn!("giving up on {:?}: {}", c.txn_id(), e);
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        match failure {
            None => c.decide()?,
            Some(_) => c.abandon()?,
        };
        let out = c.decision_envelopes();
        self.send_all(out).await;

        let mut rounds = 0;
        while !c.is_acknowledged() && rounds <= self.config.max_failover_rounds {
            match timeout(self.config.ack_timeout, incoming.next()).await {
                Ok(Some(env)) => self.absorb(&mut c, env),
                Ok(None) => return Err(Error::Shutdown),
                Err(_) => {
                    rounds += 1;
                    let map = self.membership.current_partition_map().await;
                    c.retain_live(&map);
                    let out = c.decision_envelopes();
                    self.send_all(out).await;
                }
            }
        }
        if !c.is_acknowledged() {
            warn!(
                "{:?} finished in {:?} without every acknowledgement",
                c.txn_id(),
                c.state()
            );
        }

        let outcome = c.finish()?;
        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    fn absorb(&self, c: &mut Coordination, env: Envelope) {
        match env.message {
            Message::Response(r) => c.on_response(env.source, r),
            Message::DecisionAck(p) => c.on_ack(env.source, p),
            other => warn!("unexpected {:?} from {:?}", other.kind(), env.source),
        }
    }
}
