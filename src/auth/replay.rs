//! Refresh-token replay protection.
//!
//! Refresh tokens are single use. The tracker remembers the identifiers of
//! tokens already exchanged so a second presentation can be refused, while
//! keeping memory bounded: expired entries are purged on every check, and
//! when the set is still over capacity the oldest insertions are dropped.
//!
//! Capacity eviction can forget a token that has not expired yet, which
//! would let it be replayed. Size `max_tracked` above the number of refresh
//! tokens issued within one token lifetime to keep that from happening.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};

#[derive(Debug, Default)]
struct Tracked {
    expiries: HashMap<String, DateTime<Utc>>,
    // Insertion order, oldest first. Holds exactly the keys of `expiries`.
    order: VecDeque<String>,
}

impl Tracked {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.order.len();
        let expiries = &mut self.expiries;
        self.order.retain(|token_id| {
            let expired = expiries
                .get(token_id)
                .map_or(true, |expires_at| *expires_at < now);
            if expired {
                expiries.remove(token_id);
            }
            !expired
        });
        before - self.order.len()
    }

    fn evict_oldest(&mut self, max_tracked: usize) -> usize {
        let mut evicted = 0;
        while self.order.len() > max_tracked {
            match self.order.pop_front() {
                Some(token_id) => {
                    self.expiries.remove(&token_id);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// A bounded set of consumed token identifiers.
pub struct BoundedReplayTracker<C: Clock = SystemClock> {
    max_tracked: usize,
    clock: C,
    tracked: Mutex<Tracked>,
}

impl BoundedReplayTracker<SystemClock> {
    /// Create a tracker driven by the wall clock.
    pub fn new(max_tracked: usize) -> Result<Self> {
        Self::with_clock(max_tracked, SystemClock)
    }
}

impl<C: Clock> BoundedReplayTracker<C> {
    /// Create a tracker driven by the given clock.
    pub fn with_clock(max_tracked: usize, clock: C) -> Result<Self> {
        if max_tracked == 0 {
            return Err(GatekeeperError::Config(
                "replay tracker max_tracked must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_tracked,
            clock,
            tracked: Mutex::new(Tracked::default()),
        })
    }

    /// Mark `token_id` as used.
    ///
    /// Returns `false` if it was already used (a replay), `true` if this is
    /// its first use. Purging, the lookup, insertion and eviction happen
    /// under one lock, so two concurrent presentations of the same token
    /// cannot both be accepted.
    pub fn check_and_mark_used(&self, token_id: &str, expires_at: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let mut tracked = self.tracked.lock();

        let purged = tracked.purge_expired(now);
        if purged > 0 {
            trace!(purged, "Purged expired token entries");
        }

        if tracked.expiries.contains_key(token_id) {
            debug!(token_id = %token_id, "Refresh token replay detected");
            return false;
        }

        tracked.expiries.insert(token_id.to_string(), expires_at);
        tracked.order.push_back(token_id.to_string());

        let evicted = tracked.evict_oldest(self.max_tracked);
        if evicted > 0 {
            warn!(
                evicted,
                max_tracked = self.max_tracked,
                "Replay tracker at capacity, evicted oldest entries"
            );
        }

        true
    }

    /// Whether `token_id` is currently tracked as used.
    pub fn is_used(&self, token_id: &str) -> bool {
        self.tracked.lock().expiries.contains_key(token_id)
    }

    /// Get the number of tracked entries.
    pub fn len(&self) -> usize {
        self.tracked.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_tracked(&self) -> usize {
        self.max_tracked
    }

    /// Forget every tracked token.
    pub fn clear(&self) {
        let mut tracked = self.tracked.lock();
        tracked.expiries.clear();
        tracked.order.clear();
    }
}
