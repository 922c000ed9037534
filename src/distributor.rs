//! Per-worker fetch and dispatch coordination.
//!
//! A [`JobDistributor`] pulls tenants from a [`TenantSource`], fetches work
//! for them round-robin through a [`JobFetcher`], and dispatches claimed jobs
//! to the work handler while keeping at most `max_jobs` in flight. When every
//! tenant in the rotation comes up empty it backs off on the injected
//! [`Timer`], racing the sleep against the store's wake signal so a fresh
//! enqueue resumes fetching immediately.

use crate::error::MillworkError;
use crate::repository::ClaimedJob;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Result of one fetch attempt against the store.
pub enum FetchOutcome {
    /// A job was claimed and must be dispatched.
    Success(ClaimedJob),
    /// Nothing pending for this tenant.
    Empty,
    /// The tenant has work that is not ready yet; the future resolves when
    /// it is worth fetching again. Does not occupy a job slot.
    Wait(BoxFuture<'static, ()>),
    /// The tenant is temporarily blocked (e.g. an exclusive queue is busy);
    /// move on to the next tenant.
    Retry,
}

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(claimed) => f.debug_tuple("Success").field(&claimed.job.id).finish(),
            Self::Empty => f.write_str("Empty"),
            Self::Wait(_) => f.write_str("Wait"),
            Self::Retry => f.write_str("Retry"),
        }
    }
}

/// Fetches one unit of work for a tenant.
#[async_trait]
pub trait JobFetcher: Send + Sync {
    /// Errors are fatal to the distributor; expected conditions are
    /// [`FetchOutcome`] variants.
    async fn fetch(&self, tenant: &str) -> Result<FetchOutcome>;
}

/// Restartable source of tenant batches.
///
/// Each pull yields the tenants for one rotation; pulling again refreshes
/// the rotation. Returning `None` finishes the distributor.
pub trait TenantSource: Send {
    fn next_batch(&mut self) -> Option<Vec<String>>;
}

impl<F> TenantSource for F
where
    F: FnMut() -> Option<Vec<String>> + Send,
{
    fn next_batch(&mut self) -> Option<Vec<String>> {
        self()
    }
}

/// A fixed tenant set, yielded forever.
#[derive(Debug, Clone)]
pub struct StaticTenants {
    tenants: Vec<String>,
}

impl StaticTenants {
    pub fn new(tenants: Vec<String>) -> Self {
        Self { tenants }
    }
}

impl TenantSource for StaticTenants {
    fn next_batch(&mut self) -> Option<Vec<String>> {
        Some(self.tenants.clone())
    }
}

/// Sleep capability so idle backoff is controllable in tests.
#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Timer backed by the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Destination for processor failures.
///
/// A failed processor never crashes the worker: the error goes here, the
/// slot is freed, and the job stays in `processing` for the stale checker.
pub trait ErrorSink: Send + Sync {
    fn report(&self, context: &str, error: &MillworkError);
}

/// Writes failures to stderr.
#[derive(Debug, Clone, Default)]
pub struct StderrSink;

impl ErrorSink for StderrSink {
    fn report(&self, context: &str, error: &MillworkError) {
        eprintln!("{}: {}", context, error);
    }
}

/// Collects failures in memory; for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for MemorySink {
    fn report(&self, context: &str, error: &MillworkError) {
        self.reports
            .lock()
            .unwrap()
            .push(format!("{}: {}", context, error));
    }
}

/// The work handler invoked for each claimed job; receives the job and the
/// tenant it was fetched for.
pub type WorkHandler =
    Arc<dyn Fn(ClaimedJob, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-worker fetch/dispatch loop with a bounded in-flight job count.
pub struct JobDistributor {
    tenants: Box<dyn TenantSource>,
    fetcher: Arc<dyn JobFetcher>,
    work: WorkHandler,
    max_jobs: usize,
    poll_interval: Duration,
    timer: Arc<dyn Timer>,
    error_sink: Arc<dyn ErrorSink>,
    wake: Option<mpsc::UnboundedReceiver<String>>,
}

impl JobDistributor {
    pub fn new(
        tenants: impl TenantSource + 'static,
        fetcher: Arc<dyn JobFetcher>,
        work: WorkHandler,
    ) -> Self {
        Self {
            tenants: Box::new(tenants),
            fetcher,
            work,
            max_jobs: 1,
            poll_interval: Duration::from_millis(1_000),
            timer: Arc::new(TokioTimer),
            error_sink: Arc::new(StderrSink),
            wake: None,
        }
    }

    /// Cap concurrent work invocations (clamped to at least 1).
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    /// Idle backoff between sweeps when no tenant had work.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Wake signal that cancels the idle backoff; typically the repository's
    /// wake subscription for this worker's tenants.
    pub fn with_wake(mut self, wake: mpsc::UnboundedReceiver<String>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Run until the tenant source finishes or a shutdown signal arrives.
    ///
    /// Fetch errors are fatal and propagate after in-flight work drains; the
    /// caller is expected to restart. Processor errors are reported to the
    /// error sink and do not stop the loop.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut waiters: JoinSet<String> = JoinSet::new();
        let mut parked: HashSet<String> = HashSet::new();
        let mut fatal: Option<MillworkError> = None;

        info!(max_jobs = self.max_jobs, "distributor started");

        'sweeps: loop {
            // each sweep re-pulls the source, refreshing the rotation
            let Some(rotation) = self.tenants.next_batch() else {
                debug!("tenant source finished");
                break 'sweeps;
            };

            let mut dispatched = false;
            for tenant in rotation {
                if parked.contains(&tenant) {
                    continue;
                }

                // the in-flight cap: no fetch without a free slot
                let permit = tokio::select! {
                    _ = shutdown_rx.recv() => break 'sweeps,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'sweeps,
                    },
                };

                match self.fetcher.fetch(&tenant).await {
                    Ok(FetchOutcome::Success(claimed)) => {
                        dispatched = true;
                        let work = Arc::clone(&self.work);
                        let sink = Arc::clone(&self.error_sink);
                        workers.spawn(async move {
                            let _slot = permit;
                            if let Err(err) = work(claimed, tenant.clone()).await {
                                error!(tenant = %tenant, error = %err, "job processor failed");
                                sink.report("job processor", &err);
                            }
                        });
                    }
                    Ok(FetchOutcome::Empty) => drop(permit),
                    Ok(FetchOutcome::Retry) => {
                        debug!(tenant = %tenant, "tenant blocked, advancing rotation");
                        drop(permit);
                    }
                    Ok(FetchOutcome::Wait(awaitable)) => {
                        drop(permit);
                        parked.insert(tenant.clone());
                        waiters.spawn(async move {
                            awaitable.await;
                            tenant
                        });
                    }
                    Err(err) => {
                        drop(permit);
                        fatal = Some(err);
                        break 'sweeps;
                    }
                }
            }

            while let Some(done) = waiters.try_join_next() {
                if let Ok(tenant) = done {
                    parked.remove(&tenant);
                }
            }

            if !dispatched {
                let mut sleep = self.timer.sleep(self.poll_interval);
                tokio::select! {
                    _ = shutdown_rx.recv() => break 'sweeps,
                    _ = &mut sleep => {}
                    Some(_) = recv_wake(&mut self.wake) => {
                        debug!("woken by store signal");
                    }
                    Some(done) = waiters.join_next(), if !waiters.is_empty() => {
                        if let Ok(tenant) = done {
                            parked.remove(&tenant);
                        }
                    }
                }
            }
        }

        // in-flight work is never aborted
        while workers.join_next().await.is_some() {}
        waiters.abort_all();
        info!("distributor stopped");

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn recv_wake(wake: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match wake {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
