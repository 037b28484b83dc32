// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::SiteId;
use serde::{Deserialize, Serialize};

/// TxnIds are the fundamental ordering type in the system.
///
/// They have some interesting properties:
///
///   - They are totally ordered: first by logical clock, then by the identity
///     of the allocator that issued them.
///   - They are globally unique: the allocator's [SiteId] is part of each id,
///     and a given allocator never issues the same clock value twice.
///   - They are issued monotonically-increasing by each allocator, without
///     coordination between allocators.
///
/// Every partition executes the descriptors it receives in `TxnId` order, and
/// all fragments of one multi-partition transaction share a single `TxnId`, so
/// that transaction lands in the same relative position at every partition it
/// touches.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub clock: u64,
    pub site: SiteId,
}

impl std::fmt::Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}@{}", self.clock, self.site.0))
    }
}

impl TxnId {
    pub fn new(clock: u64, site: SiteId) -> TxnId {
        TxnId { clock, site }
    }

    /// The largest id any allocator at `site` could issue.
    pub fn max_for(site: SiteId) -> TxnId {
        TxnId::new(u64::MAX, site)
    }

    /// The id an allocator at `site` starts counting from. Nothing is ever
    /// issued at clock zero, so this sorts below everything `site` issues.
    pub fn zero_for(site: SiteId) -> TxnId {
        TxnId::new(0, site)
    }

    pub fn with_clock(&self, clock: u64) -> TxnId {
        Self { clock, ..*self }
    }

    pub fn next_clock(&self) -> TxnId {
        self.with_clock(
            self.clock
                .checked_add(1)
                .expect("txn id clock overflow"),
        )
    }
}
