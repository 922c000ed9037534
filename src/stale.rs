//! Stale-claim detection and reclamation.
//!
//! A claim whose deadline (`claim_time + stale_after`) passes without an
//! acknowledge means the worker died mid-job. The [`StaleChecker`] scans
//! `processing` for such claims and reclaims each one: back to `scheduled`
//! with the job's next retry delay, or removed entirely once the retry
//! sequence is exhausted, surfacing a [`JobTimedOutError`] on the error
//! channel.

use crate::config::{CheckMode, StaleCheckerConfig};
use crate::repository::{JobRepository, StaleOutcome};
use crate::Result;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A job whose claim timed out with no retry budget left.
///
/// `timestamp_for_next_retry` is populated only when the reclaim rescheduled
/// the job via its retry policy; terminal timeouts carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTimedOutError {
    pub tenant: String,
    pub job_id: String,
    pub queue_id: String,
    pub timestamp_for_next_retry: Option<i64>,
}

impl fmt::Display for JobTimedOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job Timed Out")
    }
}

/// Scans `processing` for timed-out claims and reclaims them.
pub struct StaleChecker {
    repo: Arc<dyn JobRepository>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobTimedOutError>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl StaleChecker {
    /// Create a checker and, unless configured `Manual`, start its periodic
    /// driver.
    pub fn spawn(repo: Arc<dyn JobRepository>, config: StaleCheckerConfig) -> Arc<Self> {
        let checker = Arc::new(Self {
            repo,
            subscribers: Mutex::new(Vec::new()),
            driver: Mutex::new(None),
        });
        if let CheckMode::Auto(interval) = config.mode {
            let driver = Arc::clone(&checker);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(err) = driver.check().await {
                        warn!(error = %err, "stale check failed");
                    }
                }
            });
            *checker.driver.lock().unwrap() = Some(handle);
        }
        checker
    }

    /// One scan pass.
    ///
    /// Reclaims every claim whose deadline has passed. Jobs with retry
    /// budget left are rescheduled quietly; terminally failed jobs produce
    /// one [`JobTimedOutError`] each, returned here and pushed to every
    /// subscriber.
    pub async fn check(&self) -> Result<Vec<JobTimedOutError>> {
        let stale = self.repo.stale_claims().await?;
        let mut errors = Vec::new();
        for fingerprint in stale {
            match self.repo.report_stale(&fingerprint).await? {
                StaleOutcome::Retried { next_retry_at } => {
                    debug!(%fingerprint, next_retry_at, "stale claim rescheduled via retry");
                }
                StaleOutcome::Failed { tenant, queue, id } => {
                    warn!(%fingerprint, "job timed out");
                    errors.push(JobTimedOutError {
                        tenant,
                        job_id: id,
                        queue_id: queue,
                        timestamp_for_next_retry: None,
                    });
                }
                StaleOutcome::NotFound => {
                    // someone acknowledged or reclaimed it between the scan
                    // and this call
                }
            }
        }
        if !errors.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|tx| errors.iter().all(|err| tx.send(err.clone()).is_ok()));
        }
        Ok(errors)
    }

    /// Receive every timeout error emitted by future checks.
    pub fn errors(&self) -> mpsc::UnboundedReceiver<JobTimedOutError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Stop the periodic driver, if any.
    pub fn close(&self) {
        if let Some(handle) = self.driver.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for StaleChecker {
    fn drop(&mut self) {
        self.close();
    }
}
