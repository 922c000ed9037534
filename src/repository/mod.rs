//! Atomic state transitions over the backing store.
//!
//! Every move a job makes between `scheduled`, `pending`, and `processing`
//! goes through the [`JobRepository`] trait; nothing else touches those sets.
//! Each operation is a single atomic step in the store, so concurrent
//! producers, workers, and stale checkers can only ever observe the state
//! machine before or after a transition, never mid-flight.
//!
//! Two implementations ship: [`redis::RedisRepository`] runs each transition
//! as a server-side Lua script, and [`memory::MemoryRepository`] applies the
//! same semantics to in-process state for tests and local development.

use crate::job::{AckToken, Job, JobFingerprint};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

/// What an enqueue did with the job's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// The identity was new in this queue.
    Created,
    /// A live job with the same identity was replaced and repositioned.
    Replaced,
}

/// A successfully claimed job plus the proof of the claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// The job record as of the claim; `count` reflects this dispatch.
    pub job: Job,
    pub token: AckToken,
}

/// Result of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// A job was moved to `processing` and is owned by the caller.
    Claimed(ClaimedJob),
    /// The head of the pending queue cannot run yet: its queue is occupied
    /// by an exclusive job, or it is itself exclusive and its queue is
    /// occupied at all. Try again later.
    Blocked,
    /// Nothing pending for this tenant.
    Empty,
}

/// Options accepted by acknowledge.
///
/// Each field has a named effect; there is no open-ended bag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckOptions {
    /// Terminate a repeating job instead of computing its next run, even if
    /// `max_times` has not been reached.
    pub dont_reschedule: bool,
}

/// What an acknowledge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The job is finished and fully removed.
    Finalized,
    /// A repeating job was placed back in `scheduled`.
    Rescheduled { next_run_at: i64 },
    /// The token's generation no longer matches: a stale reclaim (or a
    /// replacement) already handled this dispatch. Dropped silently.
    StaleAck,
}

/// What reclaiming a stale claim did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleOutcome {
    /// The job had retry budget left and went back to `scheduled`.
    Retried { next_retry_at: i64 },
    /// The job was out of retries and has been removed.
    Failed {
        tenant: String,
        queue: String,
        id: String,
    },
    /// The claim is no longer stale (another path got there first).
    NotFound,
}

/// Lifecycle event published by the atomic transitions.
///
/// Delivery is best-effort over pub/sub; events observe the queue, they do
/// not drive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub tenant: String,
    pub queue: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Enqueued,
    Claimed,
    Acknowledged,
    Rescheduled,
    Failed,
}

/// The complete set of atomic queue transitions.
///
/// Implementations must uphold the placement invariants: a live fingerprint
/// is in exactly one of `scheduled`, `pending`, `processing`; the job record
/// exists iff the fingerprint is placed; `processing` scores are claim
/// deadlines.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Write the job record and place it in `scheduled` (future `run_at`) or
    /// `pending` (due). Re-enqueue of a live identity replaces attributes and
    /// repositions. Fails with `QueueLocked` if this identity itself is
    /// currently in `processing`, if the job is exclusive and its queue has
    /// any job in `processing`, or if the queue's current occupant is
    /// exclusive.
    async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome>;

    /// Move up to `limit` due fingerprints from `scheduled` to their
    /// tenants' `pending` queues, preserving `(run_at, insertion)` order.
    /// Returns how many moved.
    async fn promote_due(&self, limit: u64) -> Result<u64>;

    /// Atomically pop one pending fingerprint for the tenant, place it in
    /// `processing` with deadline `now + stale_after`, and increment the
    /// dispatch count.
    async fn claim(&self, tenant: &str, stale_after: Duration) -> Result<ClaimOutcome>;

    /// Finalize or reschedule a claimed job. Verifies the token generation;
    /// a mismatch is reported as [`AckOutcome::StaleAck`] and changes
    /// nothing.
    async fn acknowledge(&self, token: &AckToken, opts: AckOptions) -> Result<AckOutcome>;

    /// Fingerprints in `processing` whose deadline has passed.
    async fn stale_claims(&self) -> Result<Vec<JobFingerprint>>;

    /// Reclaim one stale claim: back to `scheduled` with the next retry
    /// delay, or fully removed when the retry sequence is exhausted.
    async fn report_stale(&self, fingerprint: &JobFingerprint) -> Result<StaleOutcome>;

    /// Read a live job record.
    async fn find_by_id(&self, tenant: &str, queue: &str, id: &str) -> Result<Option<Job>>;

    /// Force-remove a job from whichever set holds it. Returns whether it
    /// existed.
    async fn delete(&self, tenant: &str, queue: &str, id: &str) -> Result<bool>;

    /// Force-promote a scheduled job to `pending` immediately. Returns false
    /// if the job is not currently in `scheduled`.
    async fn invoke(&self, tenant: &str, queue: &str, id: &str) -> Result<bool>;

    /// Number of pending jobs for a tenant.
    async fn pending_count(&self, tenant: &str) -> Result<u64>;

    /// Number of scheduled jobs across all tenants.
    async fn scheduled_count(&self) -> Result<u64>;

    /// Receive the tenant id whenever a job becomes pending for one of the
    /// given tenants. Best-effort wake signal for idle distributors.
    async fn subscribe_wake(&self, tenants: &[String]) -> Result<mpsc::UnboundedReceiver<String>>;

    /// Receive lifecycle events. Best-effort.
    async fn subscribe_activity(&self) -> Result<mpsc::UnboundedReceiver<ActivityEvent>>;

    /// Release store connections and background bridges.
    async fn close(&self) -> Result<()>;
}
