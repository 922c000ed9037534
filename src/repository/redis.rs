//! Redis-backed repository.
//!
//! Every transition runs as one server-side Lua script (acknowledge uses
//! two, with the schedule computation on the host in between), so concurrent
//! workers coordinate purely through the store. The Redis server `TIME` is
//! the authoritative clock for claim deadlines and due checks.
//!
//! Connection-per-role: one multiplexed connection issues commands and
//! scripts; each subscription opens its own pub/sub connection, because a
//! subscribed Redis connection cannot issue commands.

use crate::error::MillworkError;
use crate::job::{AckToken, Job, JobFingerprint};
use crate::repository::{
    AckOptions, AckOutcome, ActivityEvent, ClaimOutcome, ClaimedJob, EnqueueOutcome,
    JobRepository, StaleOutcome,
};
use crate::schedule::ScheduleMap;
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const PROMOTE_DUE_LUA: &str = include_str!("lua/promote_due.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const ACK_PREPARE_LUA: &str = include_str!("lua/ack_prepare.lua");
const ACK_COMMIT_LUA: &str = include_str!("lua/ack_commit.lua");
const STALE_CLAIMS_LUA: &str = include_str!("lua/stale_claims.lua");
const REPORT_STALE_LUA: &str = include_str!("lua/report_stale.lua");
const DELETE_LUA: &str = include_str!("lua/delete.lua");
const INVOKE_LUA: &str = include_str!("lua/invoke.lua");

/// Key layout under a common prefix, so several queues can share one Redis.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn pending(&self, tenant: &str) -> String {
        format!("{}:pending:{}", self.prefix, tenant)
    }

    pub fn job(&self, fingerprint: &JobFingerprint) -> String {
        format!("{}:job:{}", self.prefix, fingerprint)
    }

    pub fn ids(&self, tenant: &str, queue: &str) -> String {
        format!("{}:ids:{}:{}", self.prefix, tenant, queue)
    }

    pub fn processing_set(&self, tenant: &str, queue: &str) -> String {
        format!("{}:processing:{}:{}", self.prefix, tenant, queue)
    }

    pub fn wake_channel(&self, tenant: &str) -> String {
        format!("{}:wake:{}", self.prefix, tenant)
    }

    pub fn activity_channel(&self) -> String {
        format!("{}:activity", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("millwork")
    }
}

/// Redis implementation of [`JobRepository`].
pub struct RedisRepository {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: KeySpace,
    schedules: Arc<ScheduleMap>,
    enqueue_script: Script,
    promote_due_script: Script,
    claim_script: Script,
    ack_prepare_script: Script,
    ack_commit_script: Script,
    stale_claims_script: Script,
    report_stale_script: Script,
    delete_script: Script,
    invoke_script: Script,
    bridges: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisRepository {
    /// Connect to Redis and prepare the transition scripts.
    pub async fn connect(
        url: &str,
        keys: KeySpace,
        schedules: Arc<ScheduleMap>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(client, conn, keys, schedules))
    }

    /// Build a repository over an existing connection.
    pub fn with_connection(
        client: redis::Client,
        conn: MultiplexedConnection,
        keys: KeySpace,
        schedules: Arc<ScheduleMap>,
    ) -> Self {
        Self {
            client,
            conn,
            keys,
            schedules,
            enqueue_script: Script::new(ENQUEUE_LUA),
            promote_due_script: Script::new(PROMOTE_DUE_LUA),
            claim_script: Script::new(CLAIM_LUA),
            ack_prepare_script: Script::new(ACK_PREPARE_LUA),
            ack_commit_script: Script::new(ACK_COMMIT_LUA),
            stale_claims_script: Script::new(STALE_CLAIMS_LUA),
            report_stale_script: Script::new(REPORT_STALE_LUA),
            delete_script: Script::new(DELETE_LUA),
            invoke_script: Script::new(INVOKE_LUA),
            bridges: Mutex::new(Vec::new()),
        }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Commit phase of acknowledge: reschedule at `next_run_at`, or finalize
    /// when the schedule terminated.
    async fn commit_reschedule(
        &self,
        token: &AckToken,
        last_fire: i64,
        next_run_at: Option<i64>,
    ) -> Result<AckOutcome> {
        let mut conn = self.conn();
        let next_arg = next_run_at.map(|ms| ms.to_string()).unwrap_or_default();
        let value: Value = self
            .ack_commit_script
            .key(self.keys.job(&token.fingerprint))
            .key(self.keys.processing())
            .key(self.keys.scheduled())
            .arg(self.keys.prefix())
            .arg(token.fingerprint.as_str())
            .arg(token.count)
            .arg(&next_arg)
            .arg(last_fire)
            .invoke_async(&mut conn)
            .await?;
        let reply = decode_reply(&value)?;
        match reply.first().map(String::as_str) {
            Some("rescheduled") => Ok(AckOutcome::Rescheduled {
                next_run_at: next_run_at.unwrap_or_default(),
            }),
            Some("done") => Ok(AckOutcome::Finalized),
            Some("stale") => Ok(AckOutcome::StaleAck),
            other => Err(bad_reply("ack_commit", other)),
        }
    }
}

#[async_trait]
impl JobRepository for RedisRepository {
    async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome> {
        let fp = job.fingerprint();
        let mut conn = self.conn();

        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(self.keys.scheduled())
            .key(self.keys.processing())
            .key(self.keys.job(&fp))
            .key(self.keys.ids(&job.tenant, &job.queue))
            .key(self.keys.pending(&job.tenant))
            .key(self.keys.processing_set(&job.tenant, &job.queue))
            .arg(self.keys.prefix())
            .arg(fp.as_str())
            .arg(&job.tenant)
            .arg(&job.queue)
            .arg(&job.id)
            .arg(job.run_at)
            .arg(if job.exclusive { "1" } else { "0" });
        for (name, value) in job.to_attrs() {
            invocation.arg(name).arg(value);
        }

        let value: Value = invocation.invoke_async(&mut conn).await?;
        let reply = decode_reply(&value)?;
        match reply.first().map(String::as_str) {
            Some("created") => Ok(EnqueueOutcome::Created),
            Some("replaced") => Ok(EnqueueOutcome::Replaced),
            Some("locked") => Err(MillworkError::QueueLocked {
                queue: job.queue.clone(),
            }),
            other => Err(bad_reply("enqueue", other)),
        }
    }

    async fn promote_due(&self, limit: u64) -> Result<u64> {
        let mut conn = self.conn();
        let moved: u64 = self
            .promote_due_script
            .key(self.keys.scheduled())
            .arg(self.keys.prefix())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn claim(&self, tenant: &str, stale_after: Duration) -> Result<ClaimOutcome> {
        let mut conn = self.conn();
        let value: Value = self
            .claim_script
            .key(self.keys.pending(tenant))
            .key(self.keys.processing())
            .arg(self.keys.prefix())
            .arg(stale_after.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        let Value::Array(items) = value else {
            return Err(bad_reply("claim", None));
        };
        match items.first().and_then(value_to_string).as_deref() {
            Some("empty") => Ok(ClaimOutcome::Empty),
            Some("blocked") => Ok(ClaimOutcome::Blocked),
            Some("claimed") => {
                let attrs = match items.get(1) {
                    Some(Value::Array(pairs)) => decode_attr_pairs(pairs)?,
                    _ => return Err(bad_reply("claim", Some("claimed"))),
                };
                let job = Job::from_attrs(&attrs)?;
                let token = AckToken {
                    fingerprint: job.fingerprint(),
                    count: job.count,
                };
                debug!(fingerprint = %token.fingerprint, count = token.count, "claimed job");
                Ok(ClaimOutcome::Claimed(ClaimedJob { job, token }))
            }
            other => Err(bad_reply("claim", other)),
        }
    }

    async fn acknowledge(&self, token: &AckToken, opts: AckOptions) -> Result<AckOutcome> {
        let mut conn = self.conn();
        let value: Value = self
            .ack_prepare_script
            .key(self.keys.job(&token.fingerprint))
            .key(self.keys.processing())
            .arg(self.keys.prefix())
            .arg(token.fingerprint.as_str())
            .arg(token.count)
            .arg(if opts.dont_reschedule { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        let reply = decode_reply(&value)?;
        match reply.first().map(String::as_str) {
            Some("done") => Ok(AckOutcome::Finalized),
            Some("stale") => {
                debug!(fingerprint = %token.fingerprint, "dropping stale acknowledge");
                Ok(AckOutcome::StaleAck)
            }
            Some("need_next") => {
                let last_fire: i64 = reply
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| bad_reply("ack_prepare", Some("need_next")))?;
                let schedule_type = reply.get(2).cloned().unwrap_or_default();
                let meta = reply.get(3).cloned().unwrap_or_default();
                let next = self.schedules.next_fire(&schedule_type, last_fire, &meta);
                self.commit_reschedule(token, last_fire, next).await
            }
            other => Err(bad_reply("ack_prepare", other)),
        }
    }

    async fn stale_claims(&self) -> Result<Vec<JobFingerprint>> {
        let mut conn = self.conn();
        let raw: Vec<String> = self
            .stale_claims_script
            .key(self.keys.processing())
            .invoke_async(&mut conn)
            .await?;
        Ok(raw.into_iter().map(JobFingerprint::from_raw).collect())
    }

    async fn report_stale(&self, fingerprint: &JobFingerprint) -> Result<StaleOutcome> {
        let mut conn = self.conn();
        let value: Value = self
            .report_stale_script
            .key(self.keys.job(fingerprint))
            .key(self.keys.processing())
            .key(self.keys.scheduled())
            .arg(self.keys.prefix())
            .arg(fingerprint.as_str())
            .invoke_async(&mut conn)
            .await?;
        let reply = decode_reply(&value)?;
        match reply.first().map(String::as_str) {
            Some("notfound") => Ok(StaleOutcome::NotFound),
            Some("retried") => {
                let next_retry_at: i64 = reply
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| bad_reply("report_stale", Some("retried")))?;
                Ok(StaleOutcome::Retried { next_retry_at })
            }
            Some("failed") => Ok(StaleOutcome::Failed {
                tenant: reply.get(1).cloned().unwrap_or_default(),
                queue: reply.get(2).cloned().unwrap_or_default(),
                id: reply.get(3).cloned().unwrap_or_default(),
            }),
            other => Err(bad_reply("report_stale", other)),
        }
    }

    async fn find_by_id(&self, tenant: &str, queue: &str, id: &str) -> Result<Option<Job>> {
        let fp = JobFingerprint::compose(tenant, queue, id);
        let mut conn = self.conn();
        let attrs: HashMap<String, String> = conn.hgetall(self.keys.job(&fp)).await?;
        if attrs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_attrs(&attrs)?))
    }

    async fn delete(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        let fp = JobFingerprint::compose(tenant, queue, id);
        let mut conn = self.conn();
        let removed: i64 = self
            .delete_script
            .key(self.keys.job(&fp))
            .key(self.keys.scheduled())
            .key(self.keys.processing())
            .arg(self.keys.prefix())
            .arg(fp.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn invoke(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        let fp = JobFingerprint::compose(tenant, queue, id);
        let mut conn = self.conn();
        let promoted: i64 = self
            .invoke_script
            .key(self.keys.job(&fp))
            .key(self.keys.scheduled())
            .arg(self.keys.prefix())
            .arg(fp.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted == 1)
    }

    async fn pending_count(&self, tenant: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.llen(self.keys.pending(tenant)).await?)
    }

    async fn scheduled_count(&self) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.zcard(self.keys.scheduled()).await?)
    }

    async fn subscribe_wake(&self, tenants: &[String]) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        for tenant in tenants {
            pubsub.subscribe(self.keys.wake_channel(tenant)).await?;
        }
        let wake_prefix = format!("{}:wake:", self.keys.prefix());
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(tenant) = channel.strip_prefix(&wake_prefix) else {
                    continue;
                };
                if tx.send(tenant.to_string()).is_err() {
                    break;
                }
            }
        });
        self.bridges.lock().unwrap().push(handle);
        Ok(rx)
    }

    async fn subscribe_activity(&self) -> Result<mpsc::UnboundedReceiver<ActivityEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.activity_channel()).await?;
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let event: ActivityEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable activity event");
                        continue;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        self.bridges.lock().unwrap().push(handle);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        for handle in self.bridges.lock().unwrap().drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode a flat array-of-strings script reply.
fn decode_reply(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => Ok(items.iter().filter_map(value_to_string).collect()),
        _ => Err(bad_reply("script", None)),
    }
}

/// Decode an HGETALL-shaped `[k, v, k, v, ...]` array.
fn decode_attr_pairs(pairs: &[Value]) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::with_capacity(pairs.len() / 2);
    for chunk in pairs.chunks_exact(2) {
        let (Some(key), Some(val)) = (value_to_string(&chunk[0]), value_to_string(&chunk[1]))
        else {
            return Err(bad_reply("claim attrs", None));
        };
        attrs.insert(key, val);
    }
    Ok(attrs)
}

fn bad_reply(script: &str, status: Option<&str>) -> MillworkError {
    MillworkError::Worker {
        message: match status {
            Some(status) => format!("unexpected {} reply: {}", script, status),
            None => format!("unexpected {} reply shape", script),
        },
    }
}
