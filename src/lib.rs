// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate is the ordering, coordination and recovery core of a sharded,
//! replicated, in-memory transaction processor in the style of H-Store and
//! VoltDB. Data is split into partitions; each partition is owned by one
//! [PartitionExecutor] per replica, which runs every transaction touching
//! the partition one at a time, in one global order, with no locks.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - Clients submit procedure invocations to an [Initiator], which assigns
//!     each one a [TxnId]: a clock reading paired with the initiator's
//!     [SiteId]. TxnIds define the one global order.
//!
//!   - The initiator sends one fragment of the transaction to every replica
//!     of every partition it touches. Fragments can arrive in any order.
//!
//!   - Each executor holds fragments in an ordering queue and runs the
//!     smallest one only once nothing smaller can still arrive. Fragments
//!     name their predecessor from the same initiator, and initiators send
//!     heartbeats, so a partition can tell a gap from an idle initiator.
//!
//!   - A multi-partition transaction is coordinated by its initiator: every
//!     participant runs its fragment, replies, and then blocks its partition
//!     until the decision arrives. The decision is commit only if every
//!     participant succeeded.
//!
//!   - A replica that rejoins installs a snapshot from a live replica and
//!     then passes through, without executing, every transaction the
//!     snapshot already reflects.
//!
//! What procedures do, how data is stored and how bytes move are left to
//! the [ExecutionEngine], [Transport] and [Membership] collaborators. The
//! crate ships in-process versions of each ([MemoryEngine], [Network] and
//! [LocalMembership]) for tests and experiments.
//!
//! ## Name
//!
//! A horologe is any instrument for telling the hour; this one tells every
//! partition what comes next.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("No replica of {partition:?} answered for {txn_id:?}")]
    ParticipantUnavailable {
        txn_id: TxnId,
        partition: PartitionId,
    },
    #[error("Fatal inconsistency at {txn_id:?}: {reason}")]
    FatalInconsistency { txn_id: TxnId, reason: String },
    #[error("Illegal transition of {txn_id:?} from {from:?} to {to:?}")]
    IllegalTransition {
        txn_id: TxnId,
        from: TxnState,
        to: TxnState,
    },
    #[error("Partition {0:?} has halted")]
    Halted(PartitionId),
    #[error("No snapshot source for partition {0:?}")]
    NoSnapshotSource(PartitionId),
    #[error("Snapshot could not be decoded")]
    SnapshotDecode,
    #[error("Invocation names no partitions")]
    EmptyInvocation,
    #[error("Shut down")]
    Shutdown,
}

impl Error {
    /// Protocol violations that must stop a partition rather than risk its
    /// replicas silently diverging.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FatalInconsistency { .. } | Error::IllegalTransition { .. }
        )
    }
}

mod allocator;
mod config;
mod coordinator;
mod descriptor;
mod engine;
mod executor;
mod initiator;
mod membership;
mod memory;
mod message;
mod network;
mod queue;
mod recovery;
mod txnid;
mod watermarks;

pub use allocator::{Clock, IdAllocator, RealClock, TestClock};
pub use config::Config;
pub use coordinator::TxnOutcome;
pub use descriptor::{Descriptor, Dispatch, Role, TxnState};
pub use engine::{Execution, ExecutionEngine, Outcome, ProcedureInvocation, Value};
pub use executor::PartitionExecutor;
pub use initiator::Initiator;
pub use membership::{LocalMembership, Membership, MembershipChange, PartitionId, PartitionMap};
pub use memory::MemoryEngine;
pub use message::{Decision, Envelope, Fragment, Heartbeat, Message, MessageKind, Response};
pub use network::{Inbox, Network, SiteId, Transport};
pub use recovery::{RecoveryStreamHandler, Snapshot, SnapshotSource, SnapshotStore};
pub use txnid::TxnId;
pub use watermarks::{HighWater, HighWaterLE};
