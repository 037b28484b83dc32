// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{SiteId, TxnId};
use async_std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where an [IdAllocator] reads the time its ids are built from. Only the
/// millisecond count matters; ids stay monotone whatever it returns.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall-clock milliseconds since the epoch, or zero if the system clock
/// is set before it.
pub struct RealClock;
impl Clock for RealClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A deterministic clock for tests: every read ticks a shared counter by one
/// millisecond, so clones handed to several initiators interleave their
/// reads on one timeline.
#[derive(Clone, Default)]
pub struct TestClock {
    ticks: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jumps the shared timeline forward by `millis`.
    pub fn skip(&self, millis: u64) {
        self.ticks.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }
}

/// Issues [TxnId]s for one initiating site. There is no shared or static
/// counter anywhere: each initiator owns exactly one `IdAllocator`, and two
/// allocators can only be told apart (and ordered) by their [SiteId].
pub struct IdAllocator {
    /// The clock source we'll use to draw system time from.
    clock: Box<dyn Clock>,

    /// The previously-issued TxnId, will only advance monotonically
    /// regardless of movement of the clock.
    prev: TxnId,
}

impl IdAllocator {
    pub fn new(site: SiteId, clock: Box<dyn Clock>) -> Self {
        IdAllocator {
            clock,
            prev: TxnId::zero_for(site),
        }
    }

    pub fn site(&self) -> SiteId {
        self.prev.site
    }

    /// The most recently issued id. Every id issued after this call sorts
    /// strictly above it.
    pub fn last_issued(&self) -> TxnId {
        self.prev
    }

    /// Issues a monotonically-increasing id for the current site.
    ///
    /// Follows the clock when it has moved past the last id; otherwise
    /// (stalled, rewound, or asked twice in one millisecond) the last id's
    /// clock is bumped by one.
    pub fn next_id(&mut self) -> TxnId {
        let now = self.clock.now_millis();
        self.prev = if now > self.prev.clock {
            self.prev.with_clock(now)
        } else {
            self.prev.next_clock()
        };
        self.prev
    }
}
