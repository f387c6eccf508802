use crate::models::{VoteKey, VoteRow};
use crate::store::{Change, CounterStore, StoreError, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore, broadcast};

/// In-memory counter store with failure injection and a gate that can hold
/// writes mid-flight.
pub struct FakeStore {
    rows: Mutex<BTreeMap<VoteKey, VoteRow>>,
    upserts: AtomicUsize,
    scans: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_scans: AtomicUsize,
    failing_subscribes: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    write_started: Notify,
    changes: broadcast::Sender<Change>,
}

pub struct WriteGate(Arc<Semaphore>);

impl WriteGate {
    pub fn release(self) {
        self.0.close();
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

// Stands in for a transient outage
fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

impl FakeStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            rows: Mutex::new(BTreeMap::new()),
            upserts: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            failing_scans: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
            gate: Mutex::new(None),
            write_started: Notify::new(),
            changes,
        }
    }

    pub fn seed(&self, key: VoteKey, votes: i64) {
        self.rows
            .lock()
            .expect("rows")
            .insert(key, VoteRow::new(key, votes, Utc::now()));
    }

    pub fn votes(&self, key: &VoteKey) -> Option<i64> {
        self.rows.lock().expect("rows").get(key).map(|row| row.votes)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::Acquire)
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Acquire)
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::Release);
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::Release);
    }

    pub fn fail_next_scans(&self, n: usize) {
        self.failing_scans.store(n, Ordering::Release);
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::Release);
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Emits a change without touching any row.
    pub fn announce(&self, change: Change) {
        let _ = self.changes.send(change);
    }

    /// Writes block after signalling `write_started` until the gate is released.
    pub fn hold_writes(&self) -> WriteGate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock().expect("gate") = Some(semaphore.clone());
        WriteGate(semaphore)
    }

    pub async fn write_started(&self) {
        self.write_started.notified().await;
    }
}

#[async_trait]
impl CounterStore for FakeStore {
    async fn scan_all(&self) -> Result<Vec<VoteRow>, StoreError> {
        self.scans.fetch_add(1, Ordering::AcqRel);
        if take_failure(&self.failing_scans) {
            return Err(injected());
        }
        Ok(self.rows.lock().expect("rows").values().cloned().collect())
    }

    async fn read_one(&self, key: &VoteKey) -> Result<Option<VoteRow>, StoreError> {
        if take_failure(&self.failing_reads) {
            return Err(injected());
        }
        Ok(self.rows.lock().expect("rows").get(key).cloned())
    }

    async fn upsert(&self, row: &VoteRow) -> Result<VoteRow, StoreError> {
        let gate = self.gate.lock().expect("gate").clone();
        if let Some(gate) = gate {
            self.write_started.notify_one();
            // Closed means released
            let _ = gate.acquire().await;
        }
        if take_failure(&self.failing_writes) {
            return Err(injected());
        }

        let key = row
            .key()
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown ballot type '{}'", row.ballot_type)))?;
        self.rows.lock().expect("rows").insert(key, row.clone());
        self.upserts.fetch_add(1, Ordering::AcqRel);
        let _ = self.changes.send(Change::Row(key));
        Ok(row.clone())
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        if take_failure(&self.failing_subscribes) {
            return Err(injected());
        }
        Ok(Subscription::new(self.changes.subscribe()))
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        for row in self.rows.lock().expect("rows").values_mut() {
            row.votes = 0;
            row.updated_at = now;
        }
        let _ = self.changes.send(Change::Reset);
        Ok(())
    }
}
