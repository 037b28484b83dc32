// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A small in-memory [ExecutionEngine] over a map of integer counters. It
//! understands a handful of procedures, which is enough to drive the
//! protocol from tests and the demo binary:
//!
//!   - `put(key, n)` sets `key` to `n`.
//!   - `add(key, n)` adds `n` to `key` (missing keys count as zero).
//!   - `debit(key, n)` subtracts `n`, or aborts if that would go negative.
//!   - `get(key)` reads `key`.
//!   - `abort()` always aborts.
//!
//! Anything else aborts with an explanatory result.

use crate::{Decision, Error, Execution, ExecutionEngine, Outcome, ProcedureInvocation, TxnId, Value};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryEngine {
    data: BTreeMap<String, i64>,
    /// Prior values of keys written by txns not yet finalized.
    undo: BTreeMap<TxnId, Vec<(String, Option<i64>)>>,
    executed: Vec<TxnId>,
    finalized: Vec<(TxnId, Decision)>,
}

fn aborted(reason: &str) -> Execution {
    Execution {
        result: vec![Value::Text(reason.to_string())],
        outcome: Outcome::Aborted,
    }
}

fn committed(result: Vec<Value>) -> Execution {
    Execution {
        result,
        outcome: Outcome::Committed,
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalized and tentative values alike.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.data.get(key).copied()
    }

    pub fn data(&self) -> &BTreeMap<String, i64> {
        &self.data
    }

    /// Every txn handed to `execute`, in call order.
    pub fn executed(&self) -> &[TxnId] {
        &self.executed
    }

    pub fn finalized(&self) -> &[(TxnId, Decision)] {
        &self.finalized
    }

    fn write(&mut self, txn_id: TxnId, key: &str, value: i64) {
        let old = self.data.insert(key.to_string(), value);
        self.undo
            .entry(txn_id)
            .or_default()
            .push((key.to_string(), old));
    }

    fn run(&mut self, txn_id: TxnId, invocation: &ProcedureInvocation) -> Execution {
        let params = invocation.params.as_slice();
        match (invocation.procedure.as_str(), params) {
            ("put", [Value::Text(k), Value::Int(n)]) => {
                self.write(txn_id, k, *n);
                committed(vec![Value::Int(*n)])
            }
            ("add", [Value::Text(k), Value::Int(n)]) => {
                let v = self.get(k).unwrap_or(0) + n;
                self.write(txn_id, k, v);
                committed(vec![Value::Int(v)])
            }
            ("debit", [Value::Text(k), Value::Int(n)]) => {
                let have = self.get(k).unwrap_or(0);
                if have < *n {
                    return aborted("insufficient funds");
                }
                self.write(txn_id, k, have - n);
                committed(vec![Value::Int(have - n)])
            }
            ("get", [Value::Text(k)]) => committed(vec![self
                .get(k)
                .map_or(Value::Null, Value::Int)]),
            ("abort", []) => aborted("aborted by procedure"),
            ("put", _) | ("add", _) | ("debit", _) | ("get", _) | ("abort", _) => {
                aborted("bad parameters")
            }
            _ => aborted("unknown procedure"),
        }
    }
}

impl ExecutionEngine for MemoryEngine {
    fn execute(&mut self, txn_id: TxnId, invocation: &ProcedureInvocation) -> Execution {
        trace!("executing {:?} as {:?}", invocation, txn_id);
        self.executed.push(txn_id);
        self.run(txn_id, invocation)
    }

    fn finalize(&mut self, txn_id: TxnId, decision: Decision) {
        let undo = self.undo.remove(&txn_id).unwrap_or_default();
        if decision == Decision::Rollback {
            for (key, old) in undo.into_iter().rev() {
                match old {
                    Some(v) => self.data.insert(key, v),
                    None => self.data.remove(&key),
                };
            }
        }
        self.finalized.push((txn_id, decision));
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut committed = self.data.clone();
        for writes in self.undo.values().rev() {
            for (key, old) in writes.iter().rev() {
                match old {
                    Some(v) => committed.insert(key.clone(), *v),
                    None => committed.remove(key),
                };
            }
        }
        let mut out = String::new();
        for (k, v) in committed {
            out.push_str(&format!("{}\t{}\n", k, v));
        }
        out.into_bytes()
    }

    fn install_snapshot(&mut self, state: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(state).map_err(|_| Error::SnapshotDecode)?;
        let mut data = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.splitn(2, '\t');
            match (fields.next(), fields.next()) {
                (Some(k), Some(v)) => {
                    let v: i64 = v.parse().map_err(|_| Error::SnapshotDecode)?;
                    data.insert(k.to_string(), v);
                }
                _ => return Err(Error::SnapshotDecode),
            }
        }
        self.data = data;
        self.undo.clear();
        Ok(())
    }
}
