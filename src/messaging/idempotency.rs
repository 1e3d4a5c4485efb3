//! Idempotency tracking for consumed events.
//!
//! The broker delivers at least once; the consumer skips any delivery whose
//! key is already recorded here.
//!
//! ## Crash window
//!
//! Keys live in process memory only. If the process dies after a key is marked
//! but before the broker receives the ack, the broker redelivers the message
//! after restart and the key is gone, so the event is handled again. The
//! at-most-once guarantee therefore holds for the lifetime of one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::MessagingConfig;

/// Records which idempotency keys have been fully handled.
pub trait IdempotencyTracker: Send + Sync {
    /// Whether `key` was marked and is still remembered.
    fn has_processed(&self, key: &str) -> bool;

    /// Record `key` as handled.
    fn mark_processed(&self, key: &str);

    /// Number of keys currently remembered.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounds applied to an [`InMemoryTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Oldest keys are evicted beyond this many
    pub max_keys: Option<usize>,
    /// Keys older than this read as unprocessed
    pub retention: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_keys: Some(crate::DEFAULT_IDEMPOTENCY_MAX_KEYS),
            retention: Some(Duration::from_secs(crate::DEFAULT_IDEMPOTENCY_RETENTION_SECS)),
        }
    }
}

impl TrackerConfig {
    /// Remember every key for the life of the process.
    pub fn unbounded() -> Self {
        Self {
            max_keys: None,
            retention: None,
        }
    }

    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            max_keys: config.idempotency_max_keys,
            retention: config.idempotency_retention,
        }
    }
}

#[derive(Clone, Copy)]
struct Mark {
    at: Instant,
    seq: u64,
}

#[derive(Default)]
struct KeySet {
    marks: HashMap<String, Mark>,
    // Insertion order, oldest first. May hold stale entries for re-marked keys.
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Process-local tracker guarded by a single mutex.
pub struct InMemoryTracker {
    config: TrackerConfig,
    keys: Mutex<KeySet>,
}

impl InMemoryTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(KeySet::default()),
        }
    }

    /// Tracker with no eviction at all.
    pub fn unbounded() -> Self {
        Self::new(TrackerConfig::unbounded())
    }

    fn lock(&self) -> MutexGuard<'_, KeySet> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, marked_at: Instant, now: Instant) -> bool {
        self.config
            .retention
            .is_some_and(|retention| now.duration_since(marked_at) >= retention)
    }

    fn evict(&self, keys: &mut KeySet, now: Instant) {
        let mut evicted = 0usize;

        while let Some((key, seq)) = keys.order.front() {
            let live = keys.marks.get(key).copied().filter(|mark| mark.seq == *seq);
            let over_capacity = self
                .config
                .max_keys
                .is_some_and(|max| keys.marks.len() > max);

            match live {
                None => {
                    keys.order.pop_front();
                }
                Some(mark) if over_capacity || self.is_expired(mark.at, now) => {
                    if let Some((key, _)) = keys.order.pop_front() {
                        keys.marks.remove(&key);
                        evicted += 1;
                    }
                }
                Some(_) => break,
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = keys.marks.len(), "Evicted idempotency keys");
        }
    }
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl IdempotencyTracker for InMemoryTracker {
    fn has_processed(&self, key: &str) -> bool {
        let keys = self.lock();
        keys.marks
            .get(key)
            .is_some_and(|mark| !self.is_expired(mark.at, Instant::now()))
    }

    fn mark_processed(&self, key: &str) {
        let now = Instant::now();
        let mut keys = self.lock();

        keys.next_seq += 1;
        let seq = keys.next_seq;
        keys.marks.insert(key.to_string(), Mark { at: now, seq });
        keys.order.push_back((key.to_string(), seq));
        self.evict(&mut keys, now);
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        let keys = self.lock();
        keys.marks
            .values()
            .filter(|mark| !self.is_expired(mark.at, now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unmarked_key_is_not_processed() {
        let tracker = InMemoryTracker::unbounded();
        assert!(!tracker.has_processed("group_1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_marked_key_is_processed() {
        let tracker = InMemoryTracker::unbounded();
        tracker.mark_processed("group_1");

        assert!(tracker.has_processed("group_1"));
        assert!(!tracker.has_processed("group_2"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_marking_twice_keeps_one_entry() {
        let tracker = InMemoryTracker::unbounded();
        tracker.mark_processed("k");
        tracker.mark_processed("k");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let tracker = InMemoryTracker::new(TrackerConfig {
            max_keys: Some(2),
            retention: None,
        });
        tracker.mark_processed("a");
        tracker.mark_processed("b");
        tracker.mark_processed("c");

        assert!(!tracker.has_processed("a"));
        assert!(tracker.has_processed("b"));
        assert!(tracker.has_processed("c"));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_remarked_key_survives_eviction_of_its_old_slot() {
        let tracker = InMemoryTracker::new(TrackerConfig {
            max_keys: Some(2),
            retention: None,
        });
        tracker.mark_processed("a");
        tracker.mark_processed("b");
        tracker.mark_processed("a");
        tracker.mark_processed("c");

        // "b" is now the oldest live key
        assert!(tracker.has_processed("a"));
        assert!(!tracker.has_processed("b"));
        assert!(tracker.has_processed("c"));
    }

    #[test]
    fn test_retention_expires_keys() {
        let tracker = InMemoryTracker::new(TrackerConfig {
            max_keys: None,
            retention: Some(Duration::from_millis(20)),
        });
        tracker.mark_processed("old");
        std::thread::sleep(Duration::from_millis(40));

        assert!(!tracker.has_processed("old"));
        assert_eq!(tracker.len(), 0);

        tracker.mark_processed("new");
        assert!(tracker.has_processed("new"));
    }

    #[test]
    fn test_concurrent_marks_from_many_workers() {
        let tracker = Arc::new(InMemoryTracker::unbounded());

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        tracker.mark_processed(&format!("{worker}-{i}"));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(tracker.len(), 800);
        assert!(tracker.has_processed("7-99"));
    }
}
