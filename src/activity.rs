//! Lifecycle event stream.
//!
//! The atomic transitions publish `enqueued`, `claimed`, `acknowledged`,
//! `rescheduled`, and `failed` events over the store's pub/sub. [`Activity`]
//! subscribes and forwards them to a user callback. Delivery is best-effort:
//! the stream observes the queue, it never drives it.

use crate::repository::{ActivityEvent, JobRepository};
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback invoked for each lifecycle event.
pub type ActivityHandler = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

/// A running activity subscription.
pub struct Activity {
    handle: Option<JoinHandle<()>>,
}

impl Activity {
    /// Subscribe to the repository's event stream and forward every event to
    /// the handler until closed.
    pub async fn start(repo: &Arc<dyn JobRepository>, handler: ActivityHandler) -> Result<Self> {
        let mut events = repo.subscribe_activity().await?;
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(kind = ?event.kind, queue = %event.queue, id = %event.id, "activity");
                handler(event);
            }
        });
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Stop forwarding events.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.close();
    }
}
