// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Bringing a replica back into a running partition.
//!
//! A rejoining replica starts as [crate::PartitionExecutor::rejoining]: it
//! registers its inbox so it starts receiving the live stream, but holds all
//! of it back. The [RecoveryStreamHandler] then fetches a snapshot from a
//! surviving replica and delivers it as a `RecoverySnapshot` envelope whose
//! txn id is the snapshot's cutoff. The executor installs it, replays what it
//! held back, and passes through everything at or below the cutoff.

use crate::{
    Envelope, Error, Membership, Message, PartitionId, SiteId, Transport, TxnId,
};
use async_std::sync::{Arc, Mutex};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Finalized partition state as of `cutoff`: every txn at or below `cutoff`
/// is reflected in `state`, and nothing above it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cutoff: TxnId,
    pub state: Vec<u8>,
}

/// Somewhere to get a [Snapshot] of `partition` as held by `site`.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch(&self, site: SiteId, partition: PartitionId) -> BoxFuture<'static, Result<Snapshot, Error>>;
}

/// An in-process [SnapshotSource] that serves whatever was last published
/// for each site.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    published: Arc<Mutex<BTreeMap<(SiteId, PartitionId), Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, site: SiteId, partition: PartitionId, snapshot: Snapshot) {
        debug!("{:?} published snapshot of {:?} at {:?}", site, partition, snapshot.cutoff);
        self.published
            .lock()
            .await
            .insert((site, partition), snapshot);
    }
}

impl SnapshotSource for SnapshotStore {
    fn fetch(&self, site: SiteId, partition: PartitionId) -> BoxFuture<'static, Result<Snapshot, Error>> {
        let this = self.clone();
        async move {
            let found = this.published.lock().await.get(&(site, partition)).cloned();
            found.ok_or(Error::NoSnapshotSource(partition))
        }
        .boxed()
    }
}

/// Feeds one rejoining replica the snapshot it needs.
#[derive(Clone)]
pub struct RecoveryStreamHandler {
    site: SiteId,
    partition: PartitionId,
    membership: Arc<dyn Membership>,
    source: Arc<dyn SnapshotSource>,
    transport: Arc<dyn Transport>,
}

impl RecoveryStreamHandler {
    pub fn new(
        site: SiteId,
        partition: PartitionId,
        membership: Arc<dyn Membership>,
        source: Arc<dyn SnapshotSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        RecoveryStreamHandler {
            site,
            partition,
            membership,
            source,
            transport,
        }
    }

    /// Fetches a snapshot from the first other replica of the partition
    /// that can supply one and delivers it to the rejoining site. Returns
    /// the snapshot's cutoff.
    pub fn rejoin(&self) -> BoxFuture<'static, Result<TxnId, Error>> {
        let this = self.clone();
        let span = debug_span!("rejoin", site=?self.site, partition=?self.partition);
        async move { this.rejoin_().await }.instrument(span).boxed()
    }

    async fn rejoin_(&self) -> Result<TxnId, Error> {
        let map = self.membership.current_partition_map().await;
        let candidates: Vec<SiteId> = map
            .get(&self.partition)
            .map(|replicas| replicas.iter().copied().filter(|s| *s != self.site).collect())
            .unwrap_or_default();
        for source in candidates {
            match self.source.fetch(source, self.partition).await {
                Ok(snapshot) => {
                    info!("catching up from {:?} as of {:?}", source, snapshot.cutoff);
                    let cutoff = snapshot.cutoff;
                    let env = Envelope::new(
                        cutoff,
                        source,
                        self.site,
                        Message::RecoverySnapshot(snapshot.state),
                    );
                    self.transport.send(env).await;
                    return Ok(cutoff);
                }
                Err(e) => warn!("no snapshot from {:?}: {}", source, e),
            }
        }
        Err(Error::NoSnapshotSource(self.partition))
    }
}
