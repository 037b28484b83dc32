// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operational tuning shared by initiators and executors. None of these
/// affect which transactions commit, only how long a site waits before it
/// retries or gives up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Envelopes a site's inbox holds before senders wait.
    pub inbox_capacity: usize,

    /// How long a coordinator waits for missing Responses before it looks
    /// for another replica of each silent partition and re-sends.
    pub response_timeout: Duration,

    /// How long a coordinator waits for missing Decision-acks before it
    /// re-broadcasts the decision.
    pub ack_timeout: Duration,

    /// How often an initiator tells every partition how far its ids have
    /// advanced. Partitions shared by several initiators stall for up to
    /// this long when some initiator is idle.
    pub heartbeat_interval: Duration,

    /// Response-timeout rounds after which a multi-partition transaction
    /// with a still-silent partition is rolled back. Also bounds the rounds
    /// spent re-sending decisions and fragments to replicas that stay quiet.
    pub max_failover_rounds: usize,

    /// Resolved txns each executor remembers, for duplicate detection.
    pub resolved_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            inbox_capacity: 1024,
            response_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            max_failover_rounds: 8,
            resolved_window: 4096,
        }
    }
}

impl Config {
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_failover_rounds(mut self, rounds: usize) -> Self {
        self.max_failover_rounds = rounds;
        self
    }

    pub fn with_resolved_window(mut self, window: usize) -> Self {
        self.resolved_window = window;
        self
    }
}
