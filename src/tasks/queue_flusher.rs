use crate::queue::{DrainOutcome, UpdateQueue};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running flush ticker. Dropping it stops the ticker.
pub struct QueueFlusher {
    task: Option<JoinHandle<()>>,
}

impl QueueFlusher {
    pub fn spawn(queue: Arc<UpdateQueue>, period: Duration) -> Self {
        let task = tokio::spawn(flush_pending_votes_task(queue, period));
        Self { task: Some(task) }
    }

    /// Stops the ticker and waits until no drain is running on its behalf.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for QueueFlusher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn flush_pending_votes_task(queue: Arc<UpdateQueue>, period: Duration) {
    info!("Starting background task to flush pending votes every {:?}...", period);
    let mut interval = interval(period);
    // A slow write should not cause a burst of catch-up drains
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await; // Wait for the next interval tick

        match queue.drain_once().await {
            DrainOutcome::Idle => {}
            DrainOutcome::Busy => debug!("Previous flush still in flight; skipping this tick"),
            DrainOutcome::Applied {
                key,
                delta,
                votes,
                remaining,
            } => debug!(
                "Flushed {:+} to {} (now {} votes, {:+} still pending, {} key(s) waiting)",
                delta,
                key,
                votes,
                remaining,
                queue.len()
            ),
            // Already logged as an error by the queue
            DrainOutcome::Failed { key, delta } => debug!("Keeping {:+} for {} until the next tick", delta, key),
        }
    }
}
