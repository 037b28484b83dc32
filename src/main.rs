// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use horologe::{
    Config, Initiator, LocalMembership, MemoryEngine, Membership, Network, PartitionExecutor, PartitionId,
    PartitionMap, ProcedureInvocation, RealClock, SiteId, Value,
};

use async_std::{sync::Arc, task};
use std::collections::BTreeSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;


// The end-to-end tests live here rather than in the library so they can only
// use the public API, the way a client of the crate would.

#[test]
fn failover_to_surviving_replica() {
    test::failover_to_surviving_replica();
}

#[test]
fn rollback_is_atomic_across_partitions() {
    test::rollback_is_atomic_across_partitions();
}

#[test]
fn concurrent_initiators_keep_replicas_identical() {
    test::concurrent_initiators_keep_replicas_identical();
}

#[test]
fn logical_abort_and_unusable_invocations() {
    test::logical_abort_and_unusable_invocations();
}

#[test]
fn rejoining_replica_catches_up() {
    test::rejoining_replica_catches_up();
}

#[test]
fn lost_single_partition_fragment_is_resent() {
    test::lost_single_partition_fragment_is_resent();
}

#[test]
fn single_partition_outlasts_lost_responses() {
    test::single_partition_outlasts_lost_responses();
}

/// Runs a handful of transfers over two partitions of two replicas each and
/// logs what happened. Set `RUST_LOG=horologe=debug` to watch the protocol.
pub fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    task::block_on(async {
        let config = Config::default();
        let net = Network::new();
        let mut map = PartitionMap::new();
        map.insert(PartitionId(0), vec![SiteId(1), SiteId(2)]);
        map.insert(PartitionId(1), vec![SiteId(3), SiteId(4)]);
        let initiators: BTreeSet<SiteId> = vec![SiteId(10)].into_iter().collect();
        let members = LocalMembership::new(map.clone(), initiators.clone());

        let mut running = Vec::new();
        for (partition, sites) in &map {
            for site in sites {
                let inbox = net.register(*site, config.inbox_capacity).await;
                let changes = members.subscribe().await;
                let executor = PartitionExecutor::new(
                    *site,
                    *partition,
                    MemoryEngine::new(),
                    initiators.clone(),
                    config.clone(),
                );
                let transport = Arc::new(net.clone());
                running.push((*site, task::spawn(executor.run(inbox, transport, changes))));
            }
        }

        let inbox = net.register(SiteId(10), config.inbox_capacity).await;
        let init = Initiator::new(
            SiteId(10),
            Box::new(RealClock),
            Arc::new(net.clone()),
            Arc::new(members.clone()),
            config.clone(),
        );
        init.launch_workers(inbox);

        let both: BTreeSet<PartitionId> = map.keys().copied().collect();
        let call = |name: &str, n: i64| {
            ProcedureInvocation::new(name, vec![Value::Text("balance".into()), Value::Int(n)])
        };
        for (name, n) in &[("add", 100), ("debit", 30), ("debit", 500), ("add", 5)] {
            match init.invoke(call(*name, *n), both.clone()).await {
                Ok(outcome) => info!("{}({}) -> {:?}", name, n, outcome),
                Err(e) => warn!("{}({}) failed: {}", name, n, e),
            }
        }

        net.shutdown().await;
        for (site, handle) in running {
            match handle.await {
                Ok(engine) => println!("{:?}: {:?}", site, engine.data()),
                Err(e) => println!("{:?}: {}", site, e),
            }
        }
    });
}
