use crate::models::VoteKey;
use crate::store::{Change, CounterStore, Subscription};
use crate::tally::{AggregatedResults, aggregate};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Inactive,
    Activating,
    Active,
}

/// What the displays render: the aggregated results of the latest good scan.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub phase: ViewPhase,
    pub results: Arc<AggregatedResults>,
    // Raw per-key totals, for the input screen's readback
    pub tallies: Arc<BTreeMap<VoteKey, i64>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub refreshes: u64,
}

impl ViewSnapshot {
    fn inactive() -> Self {
        Self {
            phase: ViewPhase::Inactive,
            results: Arc::new(AggregatedResults::default()),
            tallies: Arc::new(BTreeMap::new()),
            last_updated: None,
            refreshes: 0,
        }
    }

    pub fn votes_for(&self, key: &VoteKey) -> i64 {
        self.tallies.get(key).copied().unwrap_or(0)
    }
}

/// Keeps a published view of the store current for one mounted display.
///
/// Activation fetches once, then refetches everything on every change
/// notification. Refreshes run one at a time in notification order; a failed
/// refresh leaves the previous view in place.
pub struct ResultsView {
    publisher: Arc<watch::Sender<ViewSnapshot>>,
    receiver: watch::Receiver<ViewSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl ResultsView {
    pub async fn activate(store: Arc<dyn CounterStore>) -> Self {
        let (publisher, receiver) = watch::channel(ViewSnapshot::inactive());
        let publisher = Arc::new(publisher);
        publisher.send_modify(|snapshot| snapshot.phase = ViewPhase::Activating);

        // Subscribe first so nothing written during the initial fetch is missed
        let subscription = match store.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Could not subscribe to result changes (retrying in {:?}): {}", RESUBSCRIBE_DELAY, e);
                None
            }
        };

        refresh(store.as_ref(), &publisher).await;
        publisher.send_modify(|snapshot| snapshot.phase = ViewPhase::Active);

        let task = tokio::spawn(follow_changes(store, publisher.clone(), subscription));
        Self {
            publisher,
            receiver,
            task: Some(task),
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.receiver.borrow().clone()
    }

    /// A receiver that is notified on every publish.
    pub fn watch(&self) -> watch::Receiver<ViewSnapshot> {
        self.receiver.clone()
    }

    /// Releases the subscription. Once this returns nothing else is published.
    pub async fn deactivate(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.publisher.send_modify(|snapshot| snapshot.phase = ViewPhase::Inactive);
    }
}

impl Drop for ResultsView {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn refresh(store: &dyn CounterStore, publisher: &watch::Sender<ViewSnapshot>) -> bool {
    let rows = match store.scan_all().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Failed to load results, keeping the last view: {}", e);
            return false;
        }
    };

    let results = aggregate(&rows);
    let mut tallies: BTreeMap<VoteKey, i64> = BTreeMap::new();
    for row in &rows {
        if let Some(key) = row.key() {
            *tallies.entry(key).or_insert(0) += row.votes;
        }
    }

    let now = Utc::now();
    publisher.send_modify(|snapshot| {
        snapshot.results = Arc::new(results);
        snapshot.tallies = Arc::new(tallies);
        snapshot.last_updated = Some(now);
        snapshot.refreshes += 1;
    });
    true
}

async fn follow_changes(
    store: Arc<dyn CounterStore>,
    publisher: Arc<watch::Sender<ViewSnapshot>>,
    mut subscription: Option<Subscription>,
) {
    loop {
        if subscription.is_none() {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            match store.subscribe().await {
                Ok(feed) => {
                    info!("Subscribed to result changes");
                    subscription = Some(feed);
                    // Catch up on anything missed while unsubscribed
                    refresh(store.as_ref(), &publisher).await;
                }
                Err(e) => debug!("Still unable to subscribe to result changes: {}", e),
            }
            continue;
        }

        let change = match subscription.as_mut() {
            Some(feed) => feed.next().await,
            None => continue,
        };

        match change {
            Some(change) => {
                match change {
                    Change::Row(key) => debug!("{} changed; reloading", key),
                    other => debug!("Results changed ({:?}); reloading", other),
                }
                refresh(store.as_ref(), &publisher).await;
            }
            None => {
                warn!("Result change feed closed; re-subscribing in {:?}", RESUBSCRIBE_DELAY);
                if let Some(feed) = subscription.take() {
                    feed.unsubscribe();
                }
            }
        }
    }
}
