pub mod postgres;
pub mod sqlite;
pub mod unconfigured;

use crate::config::Config;
use crate::models::{VoteKey, VoteRow};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub use postgres::PgCounterStore;
pub use sqlite::SqliteCounterStore;
pub use unconfigured::UnconfiguredStore;

pub const TABLE_NAME: &str = "election_results";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store is not configured")]
    NotConfigured,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// What a change notification said. Every variant means "refetch everything";
/// the detail is only for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Row(VoteKey),
    Reset,
    Unknown,
}

/// A live change feed. Dropping it (or calling `unsubscribe`) stops delivery.
pub struct Subscription {
    rx: broadcast::Receiver<Change>,
    listener: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Change>) -> Self {
        Self { rx, listener: None }
    }

    pub fn with_listener(rx: broadcast::Receiver<Change>, listener: JoinHandle<()>) -> Self {
        Self {
            rx,
            listener: Some(listener),
        }
    }

    // Returns None once the feed is closed
    pub async fn next(&mut self) -> Option<Change> {
        match self.rx.recv().await {
            Ok(change) => Some(change),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Change feed lagged, {} notification(s) skipped", skipped);
                Some(Change::Unknown)
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// The remote counter store: one row per `(village, ballot, candidate)`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Every row, ordered by `(village, ballot, candidate)`. Empty is not an error.
    async fn scan_all(&self) -> Result<Vec<VoteRow>, StoreError>;

    async fn read_one(&self, key: &VoteKey) -> Result<Option<VoteRow>, StoreError>;

    /// Creates the row or overwrites `votes` and `updated_at`.
    async fn upsert(&self, row: &VoteRow) -> Result<VoteRow, StoreError>;

    async fn subscribe(&self) -> Result<Subscription, StoreError>;

    async fn reset_all(&self) -> Result<(), StoreError>;

    async fn set_votes(&self, key: &VoteKey, votes: i64) -> Result<VoteRow, StoreError> {
        self.upsert(&VoteRow::new(*key, votes, Utc::now())).await
    }
}

/// Read-modify-write increment. A missing row counts as zero. Not atomic:
/// concurrent writers to the same key race and the last write wins.
pub async fn increment_votes(store: &dyn CounterStore, key: &VoteKey, delta: i64) -> Result<VoteRow, StoreError> {
    let current = store.read_one(key).await?.map(|row| row.votes).unwrap_or(0);
    let Some(votes) = current.checked_add(delta) else {
        return Err(StoreError::InvalidRow(format!("{} holds {} votes; adding {:+} overflows", key, current, delta)));
    };
    store.set_votes(key, votes).await
}

/// Picks a backend from the configuration. Never fails: anything missing or
/// unreachable degrades to a store that rejects every call.
pub async fn connect(config: &Config) -> Arc<dyn CounterStore> {
    let Some(url) = config.store_url.as_deref() else {
        warn!("ELECTION_STORE_URL is not set; running without a counter store");
        return Arc::new(UnconfiguredStore);
    };

    if url.starts_with("sqlite:") {
        return match SqliteCounterStore::connect(url, config.max_connections).await {
            Ok(store) => {
                info!("Connected to SQLite counter store");
                Arc::new(store.with_poll_interval(config.flush_interval))
            }
            Err(e) => {
                error!("Failed to open SQLite counter store: {}", e);
                Arc::new(UnconfiguredStore)
            }
        };
    }

    if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let Some(key) = config.store_key.as_deref() else {
            warn!("ELECTION_STORE_KEY is not set; running without a counter store");
            return Arc::new(UnconfiguredStore);
        };
        return match PgCounterStore::connect_lazy(url, key, config.max_connections) {
            Ok(store) => {
                if let Err(e) = store.ensure_schema().await {
                    warn!("Could not ensure counter store schema (will keep retrying on use): {}", e);
                }
                Arc::new(store)
            }
            Err(e) => {
                error!("Invalid Postgres counter store URL: {}", e);
                Arc::new(UnconfiguredStore)
            }
        };
    }

    warn!("Unsupported counter store URL scheme in '{}'; running without a counter store", url);
    Arc::new(UnconfiguredStore)
}
