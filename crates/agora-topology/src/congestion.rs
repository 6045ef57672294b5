//! Per-message congestion budget (`open_n`).
//!
//! Every forwarded message carries a small budget. At a node with spare
//! capacity a non-zero budget is decremented; at a busy node it is spent on
//! opening temporary capacity instead, and passed on unchanged. A message
//! with budget zero never causes expansion anywhere.
//!
//! Capacity is counted in messages per window. Temporary capacity is opened
//! `step` slots at a time, never past the hard ceiling, and closes once it
//! has carried `budget` messages or the window rolls over.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::CongestionConfig;

/// What to do with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send it on, carrying this budget.
    Forward { open_n: u8 },
    /// Hold it and try again after `retry_in`.
    Queue { retry_in: Duration },
    Drop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongestionStats {
    pub forwarded: u64,
    pub queued: u64,
    pub dropped: u64,
    pub expansions: u64,
}

/// Admission control for one node.
#[derive(Debug)]
pub struct CongestionController {
    config: CongestionConfig,
    /// Messages admitted in the current window.
    used: u32,
    /// Temporary capacity currently open.
    extra: u32,
    /// Messages the temporary capacity may still carry.
    extra_budget: u32,
    stats: CongestionStats,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        Self {
            config,
            used: 0,
            extra: 0,
            extra_budget: 0,
            stats: CongestionStats::default(),
        }
    }

    pub fn config(&self) -> &CongestionConfig {
        &self.config
    }

    pub fn stats(&self) -> CongestionStats {
        self.stats
    }

    pub fn capacity(&self) -> u32 {
        self.config.base_capacity + self.extra
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn temporary_capacity(&self) -> u32 {
        self.extra
    }

    pub fn at_capacity(&self) -> bool {
        self.used >= self.capacity()
    }

    /// Past normal capacity: this node's own sends should ask for help.
    pub fn is_congested(&self) -> bool {
        self.used >= self.config.base_capacity
    }

    /// Budget to stamp on a message this node originates.
    pub fn outgoing_open_n(&self) -> u8 {
        if self.is_congested() {
            self.config.open_n
        } else {
            0
        }
    }

    fn can_expand(&self) -> bool {
        self.capacity() < self.config.hard_ceiling && self.config.step > 0
    }

    /// Decide the fate of a message arriving with budget `open_n`.
    /// `attempt` counts earlier queueings of the same message.
    pub fn admit(&mut self, open_n: u8, attempt: u32) -> Admission {
        if !self.at_capacity() {
            self.take_slot();
            self.stats.forwarded += 1;
            return Admission::Forward {
                open_n: open_n.saturating_sub(1),
            };
        }

        if open_n > 0 && self.can_expand() {
            let grant = self
                .config
                .step
                .min(self.config.hard_ceiling - self.capacity());
            self.extra += grant;
            self.extra_budget += self.config.budget;
            self.stats.expansions += 1;
            debug!(
                grant,
                capacity = self.capacity(),
                ceiling = self.config.hard_ceiling,
                "opened temporary capacity"
            );
            self.take_slot();
            self.stats.forwarded += 1;
            return Admission::Forward { open_n };
        }

        if attempt < self.config.max_retries {
            self.stats.queued += 1;
            let retry_in = self.config.backoff.saturating_mul(1 << attempt.min(16));
            trace!(attempt, ?retry_in, "queueing message at capacity");
            Admission::Queue { retry_in }
        } else {
            self.stats.dropped += 1;
            trace!(attempt, "dropping message at capacity");
            Admission::Drop
        }
    }

    fn take_slot(&mut self) {
        let temporary = self.used >= self.config.base_capacity;
        self.used += 1;
        if temporary && self.extra > 0 {
            self.extra_budget = self.extra_budget.saturating_sub(1);
            if self.extra_budget == 0 {
                self.close_temporary();
            }
        }
    }

    fn close_temporary(&mut self) {
        if self.extra > 0 {
            debug!(closed = self.extra, "temporary capacity closed");
        }
        self.extra = 0;
        self.extra_budget = 0;
    }

    /// Start a new window.
    pub fn roll_window(&mut self) {
        self.used = 0;
        self.close_temporary();
    }
}

/// A message waiting out its backoff.
#[derive(Debug, Clone)]
pub struct Deferred<T> {
    pub item: T,
    pub attempt: u32,
    pub ready_at: Instant,
}

/// FIFO of queued messages, bounded in length.
#[derive(Debug)]
pub struct DeferredQueue<T> {
    entries: VecDeque<Deferred<T>>,
    limit: usize,
}

impl<T> DeferredQueue<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    /// Queue an item. Hands it back when the queue is full.
    pub fn push(&mut self, item: T, attempt: u32, ready_at: Instant) -> Option<T> {
        if self.entries.len() >= self.limit {
            return Some(item);
        }
        self.entries.push_back(Deferred {
            item,
            attempt,
            ready_at,
        });
        None
    }

    /// Remove and return every entry whose backoff has elapsed, in queue order.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Deferred<T>> {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
            self.entries.drain(..).partition(|d| d.ready_at <= now);
        self.entries = waiting;
        ready.into()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
