use crate::models::VoteKey;
use crate::store::{CounterStore, StoreError, increment_votes};
use log::error;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of one drain attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was pending.
    Idle,
    /// Another drain was still in flight; this one did nothing.
    Busy,
    /// The snapshot was written; `remaining` is what arrived meanwhile.
    Applied { key: VoteKey, delta: i64, votes: i64, remaining: i64 },
    /// The write failed; the entry is kept for a later drain.
    Failed { key: VoteKey, delta: i64 },
}

// Insertion-ordered coalescing map. `order` holds each pending key exactly once.
#[derive(Default)]
struct Pending {
    deltas: HashMap<VoteKey, i64>,
    order: VecDeque<VoteKey>,
}

impl Pending {
    fn add(&mut self, key: VoteKey, delta: i64) {
        let total = self.deltas.get(&key).copied().unwrap_or(0) + delta;
        self.set(key, total);
    }

    fn set(&mut self, key: VoteKey, total: i64) {
        if total == 0 {
            if self.deltas.remove(&key).is_some() {
                self.order.retain(|k| *k != key);
            }
        } else if self.deltas.insert(key, total).is_none() {
            self.order.push_back(key);
        }
    }

    // Moves a key that stays pending to the back so every key gets its turn
    fn rotate(&mut self, key: VoteKey) {
        if self.deltas.contains_key(&key) {
            self.order.retain(|k| *k != key);
            self.order.push_back(key);
        }
    }

    fn front(&self) -> Option<(VoteKey, i64)> {
        self.order.front().map(|key| (*key, self.deltas.get(key).copied().unwrap_or(0)))
    }
}

/// Buffers observer taps and pushes them to the store one key per drain.
///
/// Taps on the same key coalesce into one signed delta. A drain snapshots the
/// delta, writes it, then subtracts exactly that snapshot, so taps that land
/// while the write is in flight stay queued. A failed write leaves the entry
/// untouched for the next drain.
pub struct UpdateQueue {
    store: Arc<dyn CounterStore>,
    pending: Mutex<Pending>,
    draining: AtomicBool,
}

impl UpdateQueue {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(Pending::default()),
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // A panic mid-update cannot leave the map half-written, so keep going
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, key: VoteKey, delta: i64) {
        if delta == 0 {
            return;
        }
        self.lock().add(key, delta);
    }

    pub fn pending_for(&self, key: &VoteKey) -> i64 {
        self.lock().deltas.get(key).copied().unwrap_or(0)
    }

    /// Pending entries in drain order.
    pub fn pending(&self) -> Vec<(VoteKey, i64)> {
        let pending = self.lock();
        pending
            .order
            .iter()
            .map(|key| (*key, pending.deltas.get(key).copied().unwrap_or(0)))
            .collect()
    }

    pub fn total_pending(&self) -> i64 {
        self.lock().deltas.values().sum()
    }

    pub fn len(&self) -> usize {
        self.lock().deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().deltas.is_empty()
    }

    /// Applies at most one pending entry to the store.
    pub async fn drain_once(&self) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return DrainOutcome::Busy;
        }
        let _guard = DrainGuard(&self.draining);

        let Some((key, delta)) = self.lock().front() else {
            return DrainOutcome::Idle;
        };

        match increment_votes(self.store.as_ref(), &key, delta).await {
            Ok(row) => {
                let mut pending = self.lock();
                let live = pending.deltas.get(&key).copied().unwrap_or(0);
                let remaining = live - delta;
                pending.set(key, remaining);
                pending.rotate(key);
                DrainOutcome::Applied {
                    key,
                    delta,
                    votes: row.votes,
                    remaining,
                }
            }
            Err(e) => {
                self.report_failure(&key, &e);
                self.lock().rotate(key);
                DrainOutcome::Failed { key, delta }
            }
        }
    }

    fn report_failure(&self, key: &VoteKey, e: &StoreError) {
        error!("Failed to flush pending votes for {}: {} (will retry)", key, e);
    }
}

// Clears the busy flag even if the drain future is dropped mid-write
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStore;

    fn key(raw: &str) -> VoteKey {
        raw.parse().expect("key")
    }

    fn queue_with(store: &Arc<FakeStore>) -> Arc<UpdateQueue> {
        Arc::new(UpdateQueue::new(store.clone()))
    }

    #[tokio::test]
    async fn repeated_taps_coalesce_into_one_write() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        let target = key("1-mayor-1");

        for _ in 0..10 {
            queue.enqueue(target, 1);
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_for(&target), 10);

        let outcome = queue.drain_once().await;
        assert_eq!(
            outcome,
            DrainOutcome::Applied {
                key: target,
                delta: 10,
                votes: 10,
                remaining: 0
            }
        );
        assert_eq!(store.upsert_count(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.drain_once().await, DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn corrections_are_summed_with_taps() {
        let store = Arc::new(FakeStore::new());
        store.seed(key("2-member-1"), 4);
        let queue = queue_with(&store);

        queue.enqueue(key("2-member-1"), 5);
        queue.enqueue(key("2-member-1"), -1);
        queue.enqueue(key("2-member-1"), -10);
        assert_eq!(queue.pending_for(&key("2-member-1")), -6);

        queue.drain_once().await;
        // The store itself does not clamp
        assert_eq!(store.votes(&key("2-member-1")), Some(-2));
    }

    #[tokio::test]
    async fn taps_that_cancel_out_leave_nothing_pending() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);

        queue.enqueue(key("3-member-2"), 1);
        queue.enqueue(key("3-member-2"), -1);

        assert!(queue.is_empty());
        assert_eq!(queue.drain_once().await, DrainOutcome::Idle);
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn one_key_per_drain() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        for candidate in 1..=5 {
            queue.enqueue(VoteKey::member(1, candidate).expect("key"), 1);
        }

        let outcome = queue.drain_once().await;

        assert!(matches!(outcome, DrainOutcome::Applied { .. }));
        assert_eq!(queue.len(), 4);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn drains_in_insertion_order() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        queue.enqueue(key("5-member-2"), 1);
        queue.enqueue(key("1-mayor-1"), 1);

        let first = queue.drain_once().await;
        assert!(matches!(first, DrainOutcome::Applied { key, .. } if key == self::key("5-member-2")));
        let second = queue.drain_once().await;
        assert!(matches!(second, DrainOutcome::Applied { key, .. } if key == self::key("1-mayor-1")));
    }

    #[tokio::test]
    async fn taps_during_a_write_stay_queued() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        let target = key("1-mayor-2");
        let gate = store.hold_writes();

        queue.enqueue(target, 3);
        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain_once().await }
        });

        store.write_started().await;
        queue.enqueue(target, 2);
        assert_eq!(queue.pending_for(&target), 5);
        gate.release();

        let outcome = drain.await.expect("drain task");
        assert_eq!(
            outcome,
            DrainOutcome::Applied {
                key: target,
                delta: 3,
                votes: 3,
                remaining: 2
            }
        );
        assert_eq!(queue.pending_for(&target), 2);
        assert_eq!(store.votes(&target), Some(3));
    }

    #[tokio::test]
    async fn correction_that_cancels_an_in_flight_write_is_kept() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        let target = key("2-member-4");
        let gate = store.hold_writes();

        queue.enqueue(target, 3);
        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain_once().await }
        });

        store.write_started().await;
        queue.enqueue(target, -3);
        assert!(queue.is_empty());
        gate.release();

        let outcome = drain.await.expect("drain task");
        assert_eq!(
            outcome,
            DrainOutcome::Applied {
                key: target,
                delta: 3,
                votes: 3,
                remaining: -3
            }
        );
        assert_eq!(queue.pending(), vec![(target, -3)]);

        assert!(matches!(queue.drain_once().await, DrainOutcome::Applied { votes: 0, remaining: 0, .. }));
        assert_eq!(store.votes(&target), Some(0));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn second_drain_while_one_is_in_flight_is_a_no_op() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        let gate = store.hold_writes();
        queue.enqueue(key("1-mayor-1"), 1);
        queue.enqueue(key("2-member-1"), 1);

        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain_once().await }
        });
        store.write_started().await;

        assert!(queue.draining.load(Ordering::Acquire));
        assert_eq!(queue.drain_once().await, DrainOutcome::Busy);

        gate.release();
        drain.await.expect("drain task");
        assert!(!queue.draining.load(Ordering::Acquire));
        assert_eq!(queue.len(), 1);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn failed_write_keeps_the_entry_for_retry() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        let target = key("4-member-99");
        queue.enqueue(target, 7);

        store.fail_next_writes(1);
        assert_eq!(queue.drain_once().await, DrainOutcome::Failed { key: target, delta: 7 });
        assert_eq!(queue.pending_for(&target), 7);
        assert_eq!(store.votes(&target), None);

        assert!(matches!(queue.drain_once().await, DrainOutcome::Applied { delta: 7, .. }));
        assert_eq!(store.votes(&target), Some(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failing_key_does_not_starve_the_others() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        queue.enqueue(key("1-mayor-1"), 1);
        queue.enqueue(key("1-mayor-2"), 1);

        store.fail_next_writes(1);
        queue.drain_once().await;
        let next = queue.drain_once().await;

        assert!(matches!(next, DrainOutcome::Applied { key, .. } if key == self::key("1-mayor-2")));
        assert_eq!(queue.pending(), vec![(key("1-mayor-1"), 1)]);
    }

    #[tokio::test]
    async fn read_failure_counts_as_a_failed_drain() {
        let store = Arc::new(FakeStore::new());
        let queue = queue_with(&store);
        queue.enqueue(key("6-member-1"), 2);

        store.fail_next_reads(1);
        assert!(matches!(queue.drain_once().await, DrainOutcome::Failed { .. }));
        assert_eq!(queue.total_pending(), 2);
        assert_eq!(store.upsert_count(), 0);
    }
}
