use crate::models::{BallotType, KeyError, VoteKey};
use crate::queue::UpdateQueue;
use crate::store::CounterStore;
use crate::tasks::QueueFlusher;
use crate::view::{ResultsView, ViewSnapshot};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// One observer's input screen: a queue for their taps, the ticker that
/// flushes it, and a live view for reading back the stored counts.
pub struct ObserverSession {
    village_number: i32,
    ballot_type: BallotType,
    queue: Arc<UpdateQueue>,
    flusher: QueueFlusher,
    view: ResultsView,
}

impl ObserverSession {
    pub async fn start(
        store: Arc<dyn CounterStore>,
        village_number: i32,
        ballot_type: BallotType,
        flush_interval: Duration,
    ) -> Result<Self, KeyError> {
        // Validates the selection before anything is spawned
        VoteKey::new(village_number, ballot_type, 1)?;

        let queue = Arc::new(UpdateQueue::new(store.clone()));
        let flusher = QueueFlusher::spawn(queue.clone(), flush_interval);
        let view = ResultsView::activate(store).await;
        info!("Observer session started for village {} ({} ballot)", village_number, ballot_type);

        Ok(Self {
            village_number,
            ballot_type,
            queue,
            flusher,
            view,
        })
    }

    pub fn village_number(&self) -> i32 {
        self.village_number
    }

    pub fn ballot_type(&self) -> BallotType {
        self.ballot_type
    }

    pub fn select_village(&mut self, village_number: i32) -> Result<(), KeyError> {
        VoteKey::new(village_number, self.ballot_type, 1)?;
        self.village_number = village_number;
        Ok(())
    }

    pub fn select_ballot(&mut self, ballot_type: BallotType) -> Result<(), KeyError> {
        VoteKey::new(self.village_number, ballot_type, 1)?;
        self.ballot_type = ballot_type;
        Ok(())
    }

    fn key_for(&self, candidate_number: i32) -> Result<VoteKey, KeyError> {
        VoteKey::new(self.village_number, self.ballot_type, candidate_number)
    }

    /// Queues `delta` votes for a candidate under the current selection.
    pub fn tap(&self, candidate_number: i32, delta: i64) -> Result<VoteKey, KeyError> {
        let key = self.key_for(candidate_number)?;
        self.queue.enqueue(key, delta);
        Ok(key)
    }

    pub fn pending_for(&self, candidate_number: i32) -> i64 {
        self.key_for(candidate_number)
            .map(|key| self.queue.pending_for(&key))
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> i64 {
        self.queue.total_pending()
    }

    pub fn pending(&self) -> Vec<(VoteKey, i64)> {
        self.queue.pending()
    }

    /// Stored count for a candidate as of the latest refresh.
    pub fn current_votes(&self, candidate_number: i32) -> i64 {
        self.key_for(candidate_number)
            .map(|key| self.view.snapshot().votes_for(&key))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.view.snapshot()
    }

    /// Stops flushing and releases the view. Unflushed taps are dropped.
    pub async fn shutdown(self) {
        self.flusher.stop().await;
        if !self.queue.is_empty() {
            warn!("Discarding unflushed votes on shutdown: {:?}", self.queue.pending());
        }
        self.view.deactivate().await;
        info!("Observer session for village {} ended", self.village_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SPOILED_BALLOT, VILLAGE_NOT_APPLICABLE};
    use crate::test_support::FakeStore;

    const TICK: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn taps_reach_the_store_and_read_back() {
        let store = Arc::new(FakeStore::new());
        let session = ObserverSession::start(store.clone(), 2, BallotType::Mayor, TICK)
            .await
            .expect("session");

        session.tap(1, 1).expect("tap");
        session.tap(1, 5).expect("tap");
        session.tap(SPOILED_BALLOT, 1).expect("tap");
        assert_eq!(session.pending_for(1), 6);
        assert_eq!(session.total_pending(), 7);

        tokio::time::sleep(TICK * 3).await;

        assert_eq!(session.total_pending(), 0);
        assert_eq!(store.votes(&VoteKey::mayor(2, 1).expect("key")), Some(6));
        assert_eq!(session.current_votes(1), 6);
        assert_eq!(session.current_votes(SPOILED_BALLOT), 1);

        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn selection_changes_the_key() {
        let store = Arc::new(FakeStore::new());
        let mut session = ObserverSession::start(store.clone(), 1, BallotType::Mayor, TICK)
            .await
            .expect("session");

        session.select_ballot(BallotType::Member).expect("ballot");
        session.select_village(6).expect("village");
        let key = session.tap(2, 1).expect("tap");

        assert_eq!(key, VoteKey::member(6, 2).expect("key"));
        assert_eq!(session.select_village(8), Err(KeyError::Village(8)));
        assert_eq!(session.village_number(), 6);

        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn member_ballot_needs_a_real_village() {
        let store = Arc::new(FakeStore::new());
        let mut session = ObserverSession::start(store, VILLAGE_NOT_APPLICABLE, BallotType::Mayor, TICK)
            .await
            .expect("session");

        assert_eq!(session.select_ballot(BallotType::Member), Err(KeyError::Village(0)));
        assert_eq!(session.ballot_type(), BallotType::Mayor);
        assert!(session.tap(1, 1).is_ok());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_an_invalid_starting_village() {
        let store = Arc::new(FakeStore::new());
        let started = ObserverSession::start(store, 0, BallotType::Member, TICK).await;
        assert!(matches!(started, Err(KeyError::Village(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_flushing() {
        let store = Arc::new(FakeStore::new());
        let session = ObserverSession::start(store.clone(), 3, BallotType::Member, TICK)
            .await
            .expect("session");
        tokio::time::sleep(TICK / 2).await;

        session.tap(1, 4).expect("tap");
        session.shutdown().await;

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(store.upsert_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
    }
}
