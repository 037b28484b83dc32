// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Decision, Error, TxnId};
use serde::{Deserialize, Serialize};

/// Parameter and result values passed through to procedures. The ordering
/// layer never looks inside them.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

/// A call to a stored procedure, as submitted by a client.
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcedureInvocation {
    pub procedure: String,
    pub params: Vec<Value>,
}

impl ProcedureInvocation {
    pub fn new(procedure: &str, params: Vec<Value>) -> Self {
        ProcedureInvocation {
            procedure: procedure.to_string(),
            params,
        }
    }
}

/// What the procedure itself asked for. `Aborted` is a logical abort: a
/// normal outcome, never retried by this layer.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Committed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub result: Vec<Value>,
    pub outcome: Outcome,
}

/// An `ExecutionEngine` runs procedures against the data of one partition.
/// Clients of this crate provide an implementation and hand one instance to
/// each [crate::PartitionExecutor], which is then its only caller.
///
/// Every call to `execute` is tentative: its effects must stay undoable until
/// the executor calls `finalize` for the same txn, with [Decision::Commit] to
/// keep them or [Decision::Rollback] to discard them. The executor finalizes
/// each txn exactly once, and never executes a second txn before finalizing
/// the first.
pub trait ExecutionEngine: Send + 'static {
    fn execute(&mut self, txn_id: TxnId, invocation: &ProcedureInvocation) -> Execution;

    fn finalize(&mut self, txn_id: TxnId, decision: Decision);

    /// Encodes all finalized state. Never includes tentative effects.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces all state with a previously encoded snapshot.
    fn install_snapshot(&mut self, state: &[u8]) -> Result<(), Error>;
}
