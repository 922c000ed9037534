//! Configuration types for workers and the stale checker.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Module for serializing `std::time::Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Configuration for a [`Worker`](crate::worker::Worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tenants this worker serves; the empty string is the default tenant.
    pub tenants: Vec<String>,
    /// In-flight concurrency cap; at least 1.
    pub max_jobs: usize,
    /// Idle poll interval when every tenant came up empty.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Grace period from claim to stale deadline.
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    /// How many due jobs one promotion pass moves to pending.
    pub promote_batch: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tenants: vec![String::new()],
            max_jobs: 1,
            poll_interval: Duration::from_millis(1_000),
            stale_after: Duration::from_secs(60),
            promote_batch: 100,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the given tenants instead of only the default tenant.
    pub fn with_tenants(mut self, tenants: Vec<String>) -> Self {
        self.tenants = tenants;
        self
    }

    /// Set the in-flight concurrency cap (clamped to at least 1).
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the claim grace period.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Set the promotion batch size.
    pub fn with_promote_batch(mut self, batch: u64) -> Self {
        self.promote_batch = batch.max(1);
        self
    }
}

/// How the stale checker is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMode {
    /// A background task calls `check()` on this cadence.
    Auto(#[serde(with = "duration_ms")] Duration),
    /// Nothing runs automatically; the caller invokes `check()` itself.
    Manual,
}

/// Configuration for a [`StaleChecker`](crate::stale::StaleChecker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleCheckerConfig {
    pub mode: CheckMode,
}

impl Default for StaleCheckerConfig {
    fn default() -> Self {
        Self {
            mode: CheckMode::Auto(Duration::from_secs(60)),
        }
    }
}

impl StaleCheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run checks automatically on the given cadence.
    pub fn auto(interval: Duration) -> Self {
        Self {
            mode: CheckMode::Auto(interval),
        }
    }

    /// Only check when the caller asks.
    pub fn manual() -> Self {
        Self {
            mode: CheckMode::Manual,
        }
    }
}
