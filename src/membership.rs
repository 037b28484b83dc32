// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::SiteId;
use async_std::sync::{Arc, RwLock};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    future::BoxFuture,
    FutureExt,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Identifies one shard of the data. Each partition has one or more replica
/// sites, all of which execute the same descriptors in the same order.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl std::fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("P{}", self.0))
    }
}

/// Replica sites of each partition, in preference order.
pub type PartitionMap = BTreeMap<PartitionId, Vec<SiteId>>;

/// Published to subscribers whenever the cluster layer changes its view.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub partitions: PartitionMap,
    pub initiators: BTreeSet<SiteId>,
}

/// Read-only view of cluster membership. Coordinators consult it when a
/// participant stops answering, executors use it to learn which initiators
/// they must hear from before running anything, and the recovery handler
/// uses it to find a snapshot source.
pub trait Membership: Send + Sync + 'static {
    fn current_partition_map(&self) -> BoxFuture<'static, PartitionMap>;
    fn initiators(&self) -> BoxFuture<'static, BTreeSet<SiteId>>;
    fn subscribe(&self) -> BoxFuture<'static, UnboundedReceiver<MembershipChange>>;
}

#[derive(Default)]
struct MembershipState {
    view: MembershipChange,
    subscribers: Vec<UnboundedSender<MembershipChange>>,
}

impl MembershipState {
    fn publish(&mut self) {
        let view = self.view.clone();
        self.subscribers
            .retain(|s| s.unbounded_send(view.clone()).is_ok());
    }
}

/// An in-process [Membership] that changes only when told to.
#[derive(Clone)]
pub struct LocalMembership {
    state: Arc<RwLock<MembershipState>>,
}

impl LocalMembership {
    pub fn new(partitions: PartitionMap, initiators: BTreeSet<SiteId>) -> Self {
        let view = MembershipChange {
            partitions,
            initiators,
        };
        LocalMembership {
            state: Arc::new(RwLock::new(MembershipState {
                view,
                subscribers: Vec::new(),
            })),
        }
    }

    pub async fn set_replicas(&self, partition: PartitionId, replicas: Vec<SiteId>) {
        let mut guard = self.state.write().await;
        debug!("partition {:?} now has replicas {:?}", partition, replicas);
        guard.view.partitions.insert(partition, replicas);
        guard.publish();
    }

    /// Removes `site` from every replica list and from the initiator set.
    pub async fn remove_site(&self, site: SiteId) {
        let mut guard = self.state.write().await;
        debug!("removing site {:?} from membership", site);
        for replicas in guard.view.partitions.values_mut() {
            replicas.retain(|s| *s != site);
        }
        guard.view.initiators.remove(&site);
        guard.publish();
    }

    pub async fn add_initiator(&self, site: SiteId) {
        let mut guard = self.state.write().await;
        guard.view.initiators.insert(site);
        guard.publish();
    }
}

impl Membership for LocalMembership {
    fn current_partition_map(&self) -> BoxFuture<'static, PartitionMap> {
        let this = self.clone();
        async move {
            let map = this.state.read().await.view.partitions.clone();
            map
        }
        .boxed()
    }

    fn initiators(&self) -> BoxFuture<'static, BTreeSet<SiteId>> {
        let this = self.clone();
        async move {
            let initiators = this.state.read().await.view.initiators.clone();
            initiators
        }
        .boxed()
    }

    fn subscribe(&self) -> BoxFuture<'static, UnboundedReceiver<MembershipChange>> {
        let this = self.clone();
        async move {
            let (send, recv) = mpsc::unbounded();
            this.state.write().await.subscribers.push(send);
            recv
        }
        .boxed()
    }
}
