//! # Replay Guard
//!
//! Tracks when each public key was first presented for signing. A key that has
//! been circulating for longer than the configured maximum age is refused, which
//! forces users to rotate their keys periodically.
//!
//! The first-seen time of a key is never refreshed. Records are kept in a
//! [`ReplayStore`]; the guard only ever touches the store through its atomic
//! insert-if-absent operation and the retention sweep.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};

use super::clock::Clock;
use super::fingerprint::KeyFingerprint;

/// Outcome of looking up a key in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirstSeen {
    /// The key was unknown and `now` has been recorded as its first-seen time.
    Recorded,
    /// The key was already known since the contained time.
    Existing(SystemTime),
}

/// Storage for replay records.
///
/// Implementations must make [`ReplayStore::first_seen_or_insert`] atomic:
/// concurrent callers for the same fingerprint must agree on a single
/// first-seen time and exactly one of them may get [`FirstSeen::Recorded`].
pub trait ReplayStore: Send + Sync {
    /// Returns the first-seen time of `fingerprint`, recording `now` if it is unknown.
    fn first_seen_or_insert(&self, fingerprint: &KeyFingerprint, now: SystemTime) -> FirstSeen;
    /// Removes every record first seen before `cutoff` and returns how many were removed.
    fn sweep(&self, cutoff: SystemTime) -> usize;
    /// Number of records currently held.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory, sharded replay store.
#[derive(Debug, Default)]
pub struct InMemoryReplayStore {
    records: DashMap<KeyFingerprint, SystemTime>,
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplayStore for InMemoryReplayStore {
    fn first_seen_or_insert(&self, fingerprint: &KeyFingerprint, now: SystemTime) -> FirstSeen {
        // the shard stays locked for the lifetime of the entry
        match self.records.entry(fingerprint.clone()) {
            Entry::Occupied(record) => FirstSeen::Existing(*record.get()),
            Entry::Vacant(slot) => {
                slot.insert(now);
                FirstSeen::Recorded
            }
        }
    }

    fn sweep(&self, cutoff: SystemTime) -> usize {
        let mut removed = 0;
        self.records.retain(|_, first_seen| {
            let keep = *first_seen >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// What the guard thinks about a presented key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    /// First time this key is seen.
    Fresh,
    /// Seen before, still inside the allowed age.
    Aged(Duration),
    /// Seen before and older than the allowed age. Issuance must be refused.
    Expired(Duration),
}

/// Decides whether a key may still be certified, based on when it was first seen.
pub struct ReplayGuard {
    store: Box<dyn ReplayStore>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    retention: Option<Duration>,
}

impl ReplayGuard {
    /// Creates a guard over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Where replay records are kept.
    /// * `clock` - Time source for first-seen and age computation.
    /// * `max_age` - Keys first seen longer ago than this are refused.
    /// * `retention` - Records older than this are dropped by [`ReplayGuard::sweep`].
    ///   `None` keeps records forever.
    pub fn new(
        store: Box<dyn ReplayStore>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
        retention: Option<Duration>,
    ) -> Self {
        ReplayGuard {
            store,
            clock,
            max_age,
            retention,
        }
    }

    /// A guard backed by an [`InMemoryReplayStore`].
    pub fn in_memory(clock: Arc<dyn Clock>, max_age: Duration, retention: Option<Duration>) -> Self {
        Self::new(
            Box::new(InMemoryReplayStore::new()),
            clock,
            max_age,
            retention,
        )
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Records the key if unknown and classifies its age.
    pub fn observe(&self, fingerprint: &KeyFingerprint) -> Decision {
        let now = self.clock.now();
        match self.store.first_seen_or_insert(fingerprint, now) {
            FirstSeen::Recorded => {
                debug!("first observation of {}", fingerprint);
                Decision::Fresh
            }
            FirstSeen::Existing(first_seen) => {
                // a clock that went backwards counts as no age at all
                let age = now.duration_since(first_seen).unwrap_or(Duration::ZERO);
                if age > self.max_age {
                    Decision::Expired(age)
                } else {
                    debug!("{} seen before, age {:?}", fingerprint, age);
                    Decision::Aged(age)
                }
            }
        }
    }

    /// Drops records older than the retention period.
    ///
    /// A dropped key is treated as fresh if it is presented again, so the
    /// retention must not be shorter than the maximum age.
    pub fn sweep(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let Some(cutoff) = self.clock.now().checked_sub(retention) else {
            return 0;
        };
        let removed = self.store.sweep(cutoff);
        if removed > 0 {
            info!(
                "replay sweep removed {} records, {} remaining",
                removed,
                self.store.len()
            );
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}
