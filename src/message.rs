// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Everything that crosses a site boundary is an [Envelope]. Descriptors are
//! never shared between partitions, even inside one process: the initiator
//! translates a transaction into one [Fragment] per partition replica, and
//! every later step of the protocol is another envelope.

use crate::{PartitionId, ProcedureInvocation, SiteId, TxnId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The global verdict on a transaction.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

/// The share of a transaction routed to one partition.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fragment {
    pub partition: PartitionId,
    pub invocation: ProcedureInvocation,
    /// Every partition the transaction touches. A single member means a
    /// single-partition transaction.
    pub involved: BTreeSet<PartitionId>,
    /// The txn the same initiator routed to `partition` immediately before
    /// this one, or `None` if this is its first. Lets the receiving executor
    /// tell a gap in its input from an idle initiator.
    pub prev: Option<TxnId>,
}

/// A partition's answer to a [Fragment].
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub partition: PartitionId,
    pub success: bool,
    pub result: Vec<Value>,
}

/// An initiator's promise to one partition: it has routed nothing to the
/// partition after `last_routed`, and will never issue an id at or below
/// the envelope's txn id again.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Heartbeat {
    pub partition: PartitionId,
    pub last_routed: Option<TxnId>,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    Fragment(Fragment),
    Response(Response),
    Decision(Decision),
    DecisionAck(PartitionId),
    /// Installed state of a partition as of the envelope's txn id.
    RecoverySnapshot(Vec<u8>),
    Heartbeat(Heartbeat),
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Fragment,
    Response,
    Decision,
    DecisionAck,
    RecoverySnapshot,
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Fragment(_) => MessageKind::Fragment,
            Message::Response(_) => MessageKind::Response,
            Message::Decision(_) => MessageKind::Decision,
            Message::DecisionAck(_) => MessageKind::DecisionAck,
            Message::RecoverySnapshot(_) => MessageKind::RecoverySnapshot,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }
}

/// Immutable once sent. The `(txn_id, source)` pair identifies a message for
/// duplicate detection.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub txn_id: TxnId,
    pub source: SiteId,
    pub destination: SiteId,
    pub message: Message,
}

impl Envelope {
    pub fn new(txn_id: TxnId, source: SiteId, destination: SiteId, message: Message) -> Self {
        Envelope {
            txn_id,
            source,
            destination,
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}
