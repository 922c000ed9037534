//! Job types and utilities for representing work units in the queue.
//!
//! This module provides the core [`Job`] struct along with its identity
//! ([`JobFingerprint`]) and claim proof ([`AckToken`]). Jobs carry everything
//! needed for scheduling, retry backoff, and lifecycle management; the queue
//! treats the payload as opaque.

use crate::error::MillworkError;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Stable identity key of a job inside the backing store.
///
/// Composed from `(tenant, queue, id)` with `:` separators. Identity
/// components are validated to exclude `:` (see [`Job::validate`]) so the
/// composition is injective and can be split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobFingerprint(String);

impl JobFingerprint {
    pub(crate) fn compose(tenant: &str, queue: &str, id: &str) -> Self {
        Self(format!("{}:{}:{}", tenant, queue, id))
    }

    /// Rebuild a fingerprint from its raw store key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw store key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into `(tenant, queue, id)`.
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        let mut it = self.0.splitn(3, ':');
        Some((it.next()?, it.next()?, it.next()?))
    }
}

impl fmt::Display for JobFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof that the holder is the current claimer of a job.
///
/// Issued by a successful claim and consumed by acknowledge. The `count`
/// generation lets the store detect acks that arrive after a stale reclaim
/// already handled the job; those are dropped silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    pub fingerprint: JobFingerprint,
    pub count: i64,
}

/// Recurrence description attached to a job.
///
/// `schedule_type` indexes into the worker's
/// [`ScheduleMap`](crate::schedule::ScheduleMap); `meta` is interpreted by
/// the schedule function (an interval for `"every"`, an expression for
/// `"cron"`). `last_fire` is maintained by the store on each acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub schedule_type: String,
    pub meta: String,
    pub last_fire: Option<i64>,
}

/// A unit of work to be processed by the queue.
///
/// Jobs are identified by `(tenant, queue, id)`; enqueueing a second job with
/// the same identity replaces the first. All timestamps are epoch
/// milliseconds.
///
/// # Examples
///
/// ## Basic job
///
/// ```rust
/// use millwork::Job;
///
/// let job = Job::new("emails", r#"{"to":"user@example.com"}"#);
///
/// assert_eq!(job.queue, "emails");
/// assert_eq!(job.tenant, "");
/// assert_eq!(job.count, 0);
/// ```
///
/// ## Repeating job with retry backoff
///
/// ```rust
/// use millwork::Job;
///
/// let job = Job::new("reports", "weekly")
///     .with_tenant("acme")
///     .with_schedule("every", "3600000")
///     .with_max_times(10)
///     .with_retry(vec![1_000, 5_000]);
///
/// assert!(job.schedule.is_some());
/// assert_eq!(job.retry, vec![1_000, 5_000]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier unique within `(tenant, queue)`.
    pub id: String,
    /// Name of the queue this job belongs to.
    pub queue: String,
    /// Logical partition; the empty string is the default tenant.
    pub tenant: String,
    /// Opaque payload, never interpreted by the queue.
    pub payload: String,
    /// When the job should run, epoch milliseconds.
    pub run_at: i64,
    /// Optional recurrence.
    pub schedule: Option<JobSchedule>,
    /// Ordered backoff delays (ms) applied on stale reclaims; empty = none.
    pub retry: Vec<i64>,
    /// How many times this job has been dispatched.
    pub count: i64,
    /// Cap on schedule repeats.
    pub max_times: Option<i64>,
    /// Serialize execution across the whole queue.
    pub exclusive: bool,
}

impl Job {
    /// Creates a new job with a generated id, scheduled to run immediately.
    pub fn new(queue: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            tenant: String::new(),
            payload: payload.into(),
            run_at: Utc::now().timestamp_millis(),
            schedule: None,
            retry: Vec::new(),
            count: 0,
            max_times: None,
            exclusive: false,
        }
    }

    /// Creates a new job scheduled to run after a delay.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use millwork::Job;
    /// use chrono::Duration;
    ///
    /// let before = chrono::Utc::now().timestamp_millis();
    /// let job = Job::with_delay("reminders", "ping", Duration::hours(1));
    /// assert!(job.run_at >= before + 3_600_000);
    /// ```
    pub fn with_delay(
        queue: impl Into<String>,
        payload: impl Into<String>,
        delay: chrono::Duration,
    ) -> Self {
        let mut job = Self::new(queue, payload);
        job.run_at += delay.num_milliseconds();
        job
    }

    /// Sets an explicit id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Assigns the job to a tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Sets an absolute run time in epoch milliseconds.
    pub fn with_run_at(mut self, run_at: i64) -> Self {
        self.run_at = run_at;
        self
    }

    /// Attaches a recurrence; `schedule_type` must name an entry in the
    /// worker's `ScheduleMap`.
    pub fn with_schedule(
        mut self,
        schedule_type: impl Into<String>,
        meta: impl Into<String>,
    ) -> Self {
        self.schedule = Some(JobSchedule {
            schedule_type: schedule_type.into(),
            meta: meta.into(),
            last_fire: None,
        });
        self
    }

    /// Sets the retry backoff sequence (delays in ms, applied in order on
    /// stale reclaims).
    pub fn with_retry(mut self, delays: Vec<i64>) -> Self {
        self.retry = delays;
        self
    }

    /// Caps how many times a repeating job fires.
    pub fn with_max_times(mut self, max_times: i64) -> Self {
        self.max_times = Some(max_times);
        self
    }

    /// Serializes execution across the queue: at most one job of this queue
    /// runs at a time.
    pub fn as_exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Stable backing-store key for this job's identity.
    pub fn fingerprint(&self) -> JobFingerprint {
        JobFingerprint::compose(&self.tenant, &self.queue, &self.id)
    }

    /// Whether this job repeats after acknowledge.
    pub fn is_repeating(&self) -> bool {
        self.schedule.is_some()
    }

    /// Whether the retry sequence still covers the current claim count.
    pub fn has_retry_left(&self) -> bool {
        self.count <= self.retry.len() as i64
    }

    /// Validates identity and policy fields.
    ///
    /// Rejects empty `queue`/`id`, `:` in any identity component (it is the
    /// fingerprint separator), non-positive retry delays, and a zero
    /// `max_times`.
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(invalid("queue must not be empty"));
        }
        if self.id.is_empty() {
            return Err(invalid("id must not be empty"));
        }
        for (name, value) in [
            ("tenant", &self.tenant),
            ("queue", &self.queue),
            ("id", &self.id),
        ] {
            if value.contains(':') {
                return Err(invalid(&format!("{} must not contain ':'", name)));
            }
        }
        if self.retry.iter().any(|d| *d <= 0) {
            return Err(invalid("retry delays must be positive"));
        }
        if self.max_times == Some(0) {
            return Err(invalid("max_times must be at least 1"));
        }
        if self.max_times.is_some() && self.schedule.is_none() {
            return Err(invalid("max_times requires a schedule"));
        }
        Ok(())
    }

    /// Encode into the flat attribute mapping stored in the job hash.
    ///
    /// Optional attributes are omitted entirely rather than stored empty.
    pub(crate) fn to_attrs(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("id", self.id.clone()),
            ("queue", self.queue.clone()),
            ("tenant", self.tenant.clone()),
            ("payload", self.payload.clone()),
            ("run_at", self.run_at.to_string()),
            ("count", self.count.to_string()),
            ("exclusive", if self.exclusive { "1" } else { "0" }.to_string()),
        ];
        if let Some(schedule) = &self.schedule {
            attrs.push(("schedule_type", schedule.schedule_type.clone()));
            attrs.push(("schedule_meta", schedule.meta.clone()));
            if let Some(last) = schedule.last_fire {
                attrs.push(("schedule_last", last.to_string()));
            }
        }
        if !self.retry.is_empty() {
            let csv = self
                .retry
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            attrs.push(("retry", csv));
        }
        if let Some(max_times) = self.max_times {
            attrs.push(("max_times", max_times.to_string()));
        }
        attrs
    }

    /// Decode from the flat attribute mapping returned by the store.
    ///
    /// The store hands back strings for every attribute; this is the single
    /// place that owns the typed coercions (ms integers, `"0"`/`"1"` bools,
    /// comma-separated retry delays).
    pub(crate) fn from_attrs(attrs: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            attrs
                .get(name)
                .cloned()
                .ok_or_else(|| invalid(&format!("missing attribute '{}'", name)))
        };
        let int = |name: &str, value: &str| -> Result<i64> {
            value
                .parse::<i64>()
                .map_err(|_| invalid(&format!("attribute '{}' is not an integer: {}", name, value)))
        };

        let run_at = int("run_at", &field("run_at")?)?;
        let count = int("count", &field("count")?)?;

        let schedule = match attrs.get("schedule_type") {
            Some(schedule_type) => Some(JobSchedule {
                schedule_type: schedule_type.clone(),
                meta: field("schedule_meta")?,
                last_fire: attrs
                    .get("schedule_last")
                    .map(|v| int("schedule_last", v))
                    .transpose()?,
            }),
            None => None,
        };

        let retry = match attrs.get("retry") {
            Some(csv) if !csv.is_empty() => csv
                .split(',')
                .map(|part| int("retry", part))
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            id: field("id")?,
            queue: field("queue")?,
            tenant: field("tenant")?,
            payload: field("payload")?,
            run_at,
            schedule,
            retry,
            count,
            max_times: attrs
                .get("max_times")
                .map(|v| int("max_times", v))
                .transpose()?,
            exclusive: attrs.get("exclusive").map(String::as_str) == Some("1"),
        })
    }
}

fn invalid(reason: &str) -> MillworkError {
    MillworkError::InvalidJob {
        reason: reason.to_string(),
    }
}
