// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [Descriptor] tracks one transaction at one site. It is owned by exactly
//! one party (a partition executor, or the coordinating task of an
//! initiator) and is never shared: other sites only ever see the envelopes
//! derived from it.
//!
//! All three roles, and recovery, run through one state machine:
//!
//! ```text
//!   single-partition: Initiated -> Queued -> Executing -> {Committed, RolledBack} -> Done
//!   participant:      Initiated -> Queued -> Executing -> AwaitingDecision
//!                                                       -> {Committed, RolledBack} -> Done
//!   coordinator:      Initiated -> CollectingResponses -> Deciding -> BroadcastingDecision
//!                                                       -> {Committed, RolledBack} -> Done
//!   pass-through:     Queued -> Done                (txn_id <= recovery cutoff)
//!   early rollback:   Queued -> RolledBack -> Done  (participant, decision arrived first)
//! ```

use crate::{
    Decision, Envelope, Error, Fragment, Message, PartitionId, ProcedureInvocation, SiteId, TxnId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    SinglePartition,
    /// Runs at the initiator, coordinating the listed partitions.
    CoordinatorOf(BTreeSet<PartitionId>),
    /// Runs at a partition replica, answering to the named coordinator site.
    ParticipantOf(SiteId),
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Initiated,
    Queued,
    Executing,
    CollectingResponses,
    Deciding,
    BroadcastingDecision,
    AwaitingDecision,
    Committed,
    RolledBack,
    Done,
}

impl TxnState {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::RolledBack | TxnState::Done
        )
    }
}

/// How an executor handles a descriptor once it reaches the head of the
/// ordering queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Already reflected in an installed snapshot: resolve without running.
    PassThrough,
    Execute,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub txn_id: TxnId,
    pub initiator: SiteId,
    pub involved: BTreeSet<PartitionId>,
    pub payload: ProcedureInvocation,
    pub role: Role,
    /// Predecessor in the initiator's chain for this partition.
    pub prev: Option<TxnId>,
    /// Set while the owning executor is catching up from a snapshot.
    pub recovery_cutoff: Option<TxnId>,
    state: TxnState,
}

impl Descriptor {
    /// Builds the descriptor a partition replica keeps for an incoming
    /// fragment. Fragments naming more than one partition are participants
    /// of the sending coordinator.
    pub fn from_fragment(envelope: &Envelope) -> Option<Descriptor> {
        let fragment: &Fragment = match &envelope.message {
            Message::Fragment(f) => f,
            _ => return None,
        };
        let role = if fragment.involved.len() > 1 {
            Role::ParticipantOf(envelope.source)
        } else {
            Role::SinglePartition
        };
        Some(Descriptor {
            txn_id: envelope.txn_id,
            initiator: envelope.source,
            involved: fragment.involved.clone(),
            payload: fragment.invocation.clone(),
            role,
            prev: fragment.prev,
            recovery_cutoff: None,
            state: TxnState::Initiated,
        })
    }

    pub fn coordinator(
        txn_id: TxnId,
        initiator: SiteId,
        involved: BTreeSet<PartitionId>,
        payload: ProcedureInvocation,
    ) -> Descriptor {
        Descriptor {
            txn_id,
            initiator,
            role: Role::CoordinatorOf(involved.clone()),
            involved,
            payload,
            prev: None,
            recovery_cutoff: None,
            state: TxnState::Initiated,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_multi_partition(&self) -> bool {
        self.involved.len() > 1
    }

    pub fn dispatch_mode(&self) -> Dispatch {
        match self.recovery_cutoff {
            Some(cutoff) if self.txn_id <= cutoff => Dispatch::PassThrough,
            _ => Dispatch::Execute,
        }
    }

    fn allows(&self, to: TxnState) -> bool {
        use TxnState::*;
        let from = self.state;
        match (&self.role, from, to) {
            (_, Committed, Done) | (_, RolledBack, Done) => true,

            (Role::CoordinatorOf(_), Initiated, CollectingResponses) => true,
            (Role::CoordinatorOf(_), CollectingResponses, Deciding) => true,
            (Role::CoordinatorOf(_), Deciding, BroadcastingDecision) => true,
            (Role::CoordinatorOf(_), BroadcastingDecision, Committed) => true,
            (Role::CoordinatorOf(_), BroadcastingDecision, RolledBack) => true,
            (Role::CoordinatorOf(_), _, _) => false,

            (_, Initiated, Queued) => true,
            (_, Queued, Executing) => true,
            (_, Queued, Done) => self.dispatch_mode() == Dispatch::PassThrough,

            (Role::SinglePartition, Executing, Committed) => true,
            (Role::SinglePartition, Executing, RolledBack) => true,

            (Role::ParticipantOf(_), Queued, RolledBack) => true,
            (Role::ParticipantOf(_), Executing, AwaitingDecision) => true,
            (Role::ParticipantOf(_), AwaitingDecision, Committed) => true,
            (Role::ParticipantOf(_), AwaitingDecision, RolledBack) => true,

            _ => false,
        }
    }

    /// Moves to `to`, or reports the attempt as a protocol violation without
    /// changing anything.
    pub fn transition(&mut self, to: TxnState) -> Result<(), Error> {
        if !self.allows(to) {
            return Err(Error::IllegalTransition {
                txn_id: self.txn_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// The resolved state a decision leads to.
    pub fn resolve_with(&mut self, decision: Decision) -> Result<(), Error> {
        self.transition(match decision {
            Decision::Commit => TxnState::Committed,
            Decision::Rollback => TxnState::RolledBack,
        })
    }
}
