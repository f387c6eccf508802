use super::{CounterStore, StoreError, Subscription};
use crate::models::{VoteKey, VoteRow};
use async_trait::async_trait;

// Stand-in when no store is configured; screens keep running on an empty view
pub struct UnconfiguredStore;

#[async_trait]
impl CounterStore for UnconfiguredStore {
    async fn scan_all(&self) -> Result<Vec<VoteRow>, StoreError> {
        Err(StoreError::NotConfigured)
    }

    async fn read_one(&self, _key: &VoteKey) -> Result<Option<VoteRow>, StoreError> {
        Err(StoreError::NotConfigured)
    }

    async fn upsert(&self, _row: &VoteRow) -> Result<VoteRow, StoreError> {
        Err(StoreError::NotConfigured)
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        Err(StoreError::NotConfigured)
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        Err(StoreError::NotConfigured)
    }
}
