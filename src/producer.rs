//! Producer surface: enqueue, look up, delete, and force-run jobs.

use crate::config::StaleCheckerConfig;
use crate::job::Job;
use crate::repository::{EnqueueOutcome, JobRepository};
use crate::stale::StaleChecker;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// What an enqueue returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub id: String,
    pub queue: String,
    pub outcome: EnqueueOutcome,
}

/// Public API for putting jobs into the queue and managing them.
///
/// The producer owns the [`StaleChecker`] handle for its repository; by
/// default the checker runs periodically, and tests configure it `Manual`.
///
/// # Examples
///
/// ```rust
/// use millwork::{Producer, Job, StaleCheckerConfig};
/// use millwork::repository::memory::MemoryRepository;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = Producer::new(
///     Arc::new(MemoryRepository::new()),
///     StaleCheckerConfig::manual(),
/// );
///
/// let receipt = producer.enqueue(Job::new("emails", "hello").with_id("e1")).await?;
/// assert_eq!(receipt.id, "e1");
///
/// let found = producer.find_by_id("emails", "e1").await?;
/// assert!(found.is_some());
///
/// assert!(producer.delete("emails", "e1").await?);
/// producer.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    repo: Arc<dyn JobRepository>,
    stale_checker: Arc<StaleChecker>,
}

impl Producer {
    pub fn new(repo: Arc<dyn JobRepository>, stale_config: StaleCheckerConfig) -> Self {
        let stale_checker = StaleChecker::spawn(Arc::clone(&repo), stale_config);
        Self {
            repo,
            stale_checker,
        }
    }

    /// Validate and enqueue a job. Re-enqueueing a live identity replaces
    /// it; enqueueing over a job currently being processed, or onto a locked
    /// exclusive queue, fails with `QueueLocked`.
    pub async fn enqueue(&self, job: Job) -> Result<EnqueueReceipt> {
        job.validate()?;
        let outcome = self.repo.enqueue(&job).await?;
        info!(queue = %job.queue, id = %job.id, outcome = ?outcome, "enqueued job");
        Ok(EnqueueReceipt {
            id: job.id,
            queue: job.queue,
            outcome,
        })
    }

    /// Look up a live job in the default tenant.
    pub async fn find_by_id(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        self.find_by_id_in("", queue, id).await
    }

    /// Look up a live job in a tenant.
    pub async fn find_by_id_in(&self, tenant: &str, queue: &str, id: &str) -> Result<Option<Job>> {
        self.repo.find_by_id(tenant, queue, id).await
    }

    /// Remove a job from the default tenant, wherever it is. Returns whether
    /// it existed.
    pub async fn delete(&self, queue: &str, id: &str) -> Result<bool> {
        self.delete_in("", queue, id).await
    }

    /// Remove a job from a tenant.
    pub async fn delete_in(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        self.repo.delete(tenant, queue, id).await
    }

    /// Force a scheduled job in the default tenant to run now. Returns false
    /// if the job is not currently scheduled.
    pub async fn invoke(&self, queue: &str, id: &str) -> Result<bool> {
        self.invoke_in("", queue, id).await
    }

    /// Force a scheduled job in a tenant to run now.
    pub async fn invoke_in(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        self.repo.invoke(tenant, queue, id).await
    }

    /// Pending depth for a tenant.
    pub async fn pending_count(&self, tenant: &str) -> Result<u64> {
        self.repo.pending_count(tenant).await
    }

    /// Scheduled depth across all tenants.
    pub async fn scheduled_count(&self) -> Result<u64> {
        self.repo.scheduled_count().await
    }

    /// The stale checker bound to this producer's repository.
    pub fn stale_checker(&self) -> &Arc<StaleChecker> {
        &self.stale_checker
    }

    /// Stop the stale checker and release store connections.
    pub async fn close(&self) -> Result<()> {
        self.stale_checker.close();
        self.repo.close().await
    }
}
