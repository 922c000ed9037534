//! Worker types for processing claimed jobs.
//!
//! A [`Worker`] binds a user processor to a
//! [`JobDistributor`](crate::distributor::JobDistributor) over the
//! repository. The worker never acknowledges on the processor's behalf: the
//! processor receives an [`Acknowledger`] and must call
//! [`Acknowledger::acknowledge`] itself, or the claim goes stale and the
//! stale checker reclaims it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use millwork::{Worker, WorkerConfig, Job};
//! use millwork::repository::{memory::MemoryRepository, AckOptions, JobRepository};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo: Arc<dyn JobRepository> = Arc::new(MemoryRepository::new());
//!
//! let mut worker = Worker::new(
//!     Arc::clone(&repo),
//!     Arc::new(|claimed, ack| {
//!         Box::pin(async move {
//!             println!("processing {}", claimed.job.id);
//!             ack.acknowledge(&claimed.token, AckOptions::default()).await?;
//!             Ok(())
//!         })
//!     }),
//!     WorkerConfig::default(),
//! );
//!
//! repo.enqueue(&Job::new("emails", "hi")).await?;
//! worker.start().await?;
//! // ... later
//! worker.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::WorkerConfig;
use crate::distributor::{
    ErrorSink, FetchOutcome, JobDistributor, JobFetcher, StaticTenants, StderrSink, Timer,
    TokioTimer, WorkHandler,
};
use crate::error::MillworkError;
use crate::job::AckToken;
use crate::repository::{AckOptions, AckOutcome, ClaimOutcome, ClaimedJob, JobRepository};
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Finalizes claimed jobs.
///
/// Cheap to clone; a clone is handed to every processor invocation.
#[derive(Clone)]
pub struct Acknowledger {
    repo: Arc<dyn JobRepository>,
}

impl Acknowledger {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self { repo }
    }

    /// Finalize or reschedule the claim proven by `token`.
    ///
    /// With `dont_reschedule` set, a repeating job is terminated instead of
    /// rescheduled, even if `max_times` has not been reached. A token whose
    /// generation no longer matches comes back as [`AckOutcome::StaleAck`]
    /// and changes nothing.
    pub async fn acknowledge(&self, token: &AckToken, opts: AckOptions) -> Result<AckOutcome> {
        let outcome = self.repo.acknowledge(token, opts).await?;
        debug!(fingerprint = %token.fingerprint, outcome = ?outcome, "acknowledged");
        Ok(outcome)
    }
}

/// The user processor: receives the claimed job and an [`Acknowledger`],
/// and must acknowledge before returning for the job to finish.
pub type JobProcessor =
    Arc<dyn Fn(ClaimedJob, Acknowledger) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Fetcher that promotes due jobs and claims from a tenant's pending queue.
struct RepoFetcher {
    repo: Arc<dyn JobRepository>,
    stale_after: Duration,
    promote_batch: u64,
}

#[async_trait]
impl JobFetcher for RepoFetcher {
    async fn fetch(&self, tenant: &str) -> Result<FetchOutcome> {
        self.repo.promote_due(self.promote_batch).await?;
        match self.repo.claim(tenant, self.stale_after).await? {
            ClaimOutcome::Claimed(claimed) => Ok(FetchOutcome::Success(claimed)),
            ClaimOutcome::Blocked => Ok(FetchOutcome::Retry),
            ClaimOutcome::Empty => Ok(FetchOutcome::Empty),
        }
    }
}

/// A worker that claims jobs for its tenants and runs them through the
/// processor, at most `max_jobs` at a time.
pub struct Worker {
    repo: Arc<dyn JobRepository>,
    processor: JobProcessor,
    config: WorkerConfig,
    acknowledger: Acknowledger,
    timer: Arc<dyn Timer>,
    error_sink: Arc<dyn ErrorSink>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Worker {
    pub fn new(repo: Arc<dyn JobRepository>, processor: JobProcessor, config: WorkerConfig) -> Self {
        let acknowledger = Acknowledger::new(Arc::clone(&repo));
        Self {
            repo,
            processor,
            config,
            acknowledger,
            timer: Arc::new(TokioTimer),
            error_sink: Arc::new(StderrSink),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Override the idle-backoff timer; for tests.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Override where processor failures are reported.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// The acknowledger processors use to finalize claims.
    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    /// Start the fetch/dispatch loop in the background.
    pub async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(MillworkError::Worker {
                message: "worker already started".to_string(),
            });
        }

        let wake = self.repo.subscribe_wake(&self.config.tenants).await?;
        let fetcher = Arc::new(RepoFetcher {
            repo: Arc::clone(&self.repo),
            stale_after: self.config.stale_after,
            promote_batch: self.config.promote_batch,
        });

        let processor = Arc::clone(&self.processor);
        let acknowledger = self.acknowledger.clone();
        let work: WorkHandler = Arc::new(move |claimed, _tenant| {
            processor(claimed, acknowledger.clone())
        });

        let distributor = JobDistributor::new(
            StaticTenants::new(self.config.tenants.clone()),
            fetcher,
            work,
        )
        .with_max_jobs(self.config.max_jobs)
        .with_poll_interval(self.config.poll_interval)
        .with_timer(Arc::clone(&self.timer))
        .with_error_sink(Arc::clone(&self.error_sink))
        .with_wake(wake);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(tokio::spawn(distributor.run(shutdown_rx)));
        info!(tenants = ?self.config.tenants, "worker started");
        Ok(())
    }

    /// Signal shutdown, wait for in-flight work to drain, and release the
    /// store subscriptions.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|err| MillworkError::Worker {
                message: format!("distributor task failed: {}", err),
            })??;
        }
        self.repo.close().await?;
        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobFingerprint;
    use crate::repository::memory::MemoryRepository;

    #[test]
    fn test_processor_type_is_constructible() {
        let _processor: JobProcessor =
            Arc::new(|_claimed, _ack| Box::pin(async move { Ok(()) }));
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_token_is_stale() {
        let repo: Arc<dyn JobRepository> = Arc::new(MemoryRepository::new());
        let acknowledger = Acknowledger::new(repo);
        let token = AckToken {
            fingerprint: JobFingerprint::from_raw(":q:ghost"),
            count: 1,
        };
        let outcome = acknowledger
            .acknowledge(&token, AckOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::StaleAck);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let repo: Arc<dyn JobRepository> = Arc::new(MemoryRepository::new());
        let mut worker = Worker::new(
            repo,
            Arc::new(|_claimed, _ack| Box::pin(async move { Ok(()) })),
            WorkerConfig::default(),
        );
        worker.start().await.unwrap();
        assert!(worker.start().await.is_err());
        worker.close().await.unwrap();
    }
}
