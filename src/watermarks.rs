// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::TxnId;
use pergola::{LatticeElt, MaxDef, MaxUnitDefault};
use serde::{Deserialize, Serialize};

/// A partition's high-water mark: the largest [TxnId] it has resolved
/// (committed, rolled back or passed through). Everything at or below it
/// has either been applied to the partition's state or is covered by an
/// installed snapshot.
#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighWater(pub TxnId);

// This says "TxnId::default() is the lattice unit for pergola::MaxDef<HighWater>".
impl MaxUnitDefault for HighWater {}

/// The high-water mark as a max-lattice element, so the only way to move it
/// is a join, and a join can never move it backwards.
pub type HighWaterLE = LatticeElt<MaxDef<HighWater>>;

pub(crate) trait HighWaterLEExt {
    fn txn_id(&self) -> TxnId;
    fn advance_to(&mut self, txn_id: TxnId);
    fn covers(&self, txn_id: TxnId) -> bool;
}

impl HighWaterLEExt for HighWaterLE {
    fn txn_id(&self) -> TxnId {
        self.value.0
    }

    fn advance_to(&mut self, txn_id: TxnId) {
        let next: HighWaterLE = HighWater(txn_id).into();
        *self = self.join(&next);
    }

    fn covers(&self, txn_id: TxnId) -> bool {
        txn_id <= self.value.0
    }
}
