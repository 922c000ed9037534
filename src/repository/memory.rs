//! In-memory repository for tests and local development.
//!
//! Applies exactly the same transition semantics as the Redis scripts to
//! in-process state behind one mutex, with an injected [`Clock`] so delayed
//! jobs and stale deadlines can be driven deterministically from tests.

use crate::clock::{Clock, MockClock, SystemClock};
use crate::error::MillworkError;
use crate::job::{AckToken, Job, JobFingerprint};
use crate::repository::{
    AckOptions, AckOutcome, ActivityEvent, ActivityKind, ClaimOutcome, ClaimedJob,
    EnqueueOutcome, JobRepository, StaleOutcome,
};
use crate::schedule::ScheduleMap;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    /// fp -> live job record (including its dispatch count).
    jobs: HashMap<String, Job>,
    /// fp -> (run_at, insertion seq); ordering is (run_at, seq).
    scheduled: HashMap<String, (i64, u64)>,
    /// tenant -> FIFO of pending fingerprints.
    pending: HashMap<String, VecDeque<String>>,
    /// fp -> claim deadline.
    processing: HashMap<String, i64>,
    /// (tenant, queue) -> live ids.
    ids: HashMap<(String, String), HashSet<String>>,
    seq: u64,
    wake_subs: Vec<(HashSet<String>, mpsc::UnboundedSender<String>)>,
    activity_subs: Vec<mpsc::UnboundedSender<ActivityEvent>>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Whether the queue refuses a new entrant: true when any job of the
    /// queue currently in `processing` is exclusive, or when the newcomer is
    /// exclusive and the queue has any job in `processing`.
    fn queue_locked_for(&self, tenant: &str, queue: &str, newcomer_exclusive: bool) -> bool {
        let mut occupied = false;
        for fp in self.processing.keys() {
            let Some(job) = self.jobs.get(fp) else {
                continue;
            };
            if job.tenant == tenant && job.queue == queue {
                if job.exclusive {
                    return true;
                }
                occupied = true;
            }
        }
        newcomer_exclusive && occupied
    }

    fn send_wake(&mut self, tenant: &str) {
        self.wake_subs.retain(|(tenants, tx)| {
            if !tenants.contains(tenant) {
                return true;
            }
            tx.send(tenant.to_string()).is_ok()
        });
    }

    fn send_activity(&mut self, kind: ActivityKind, job: &Job) {
        let event = ActivityEvent {
            kind,
            tenant: job.tenant.clone(),
            queue: job.queue.clone(),
            id: job.id.clone(),
        };
        self.activity_subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Remove every trace of a job. The caller decides which sets it could
    /// have been in.
    fn remove_everywhere(&mut self, fp: &str) {
        if let Some(job) = self.jobs.remove(fp) {
            self.scheduled.remove(fp);
            self.processing.remove(fp);
            if let Some(queue) = self.pending.get_mut(&job.tenant) {
                queue.retain(|candidate| candidate != fp);
            }
            if let Some(ids) = self.ids.get_mut(&(job.tenant.clone(), job.queue.clone())) {
                ids.remove(&job.id);
            }
        }
    }
}

/// In-memory implementation of [`JobRepository`].
///
/// # Examples
///
/// ```rust
/// use millwork::repository::{memory::MemoryRepository, JobRepository, ClaimOutcome};
/// use millwork::Job;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = MemoryRepository::new();
/// repo.enqueue(&Job::new("mail", "hi").with_id("m1")).await?;
///
/// match repo.claim("", Duration::from_secs(30)).await? {
///     ClaimOutcome::Claimed(claimed) => assert_eq!(claimed.job.id, "m1"),
///     other => panic!("expected a claim, got {:?}", other),
/// }
/// # Ok(())
/// # }
/// ```
pub struct MemoryRepository {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    schedules: Arc<ScheduleMap>,
}

impl MemoryRepository {
    /// Wall-clock repository with the standard schedule map.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemClock), Arc::new(ScheduleMap::standard()))
    }

    /// Repository driven by a mock clock.
    pub fn with_clock(clock: MockClock) -> Self {
        Self::with_parts(Arc::new(clock), Arc::new(ScheduleMap::standard()))
    }

    pub fn with_parts(clock: Arc<dyn Clock>, schedules: Arc<ScheduleMap>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            schedules,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome> {
        let now = self.now();
        let fp = job.fingerprint().as_str().to_string();
        let mut state = self.state.lock().unwrap();

        if state.processing.contains_key(&fp) {
            return Err(MillworkError::QueueLocked {
                queue: job.queue.clone(),
            });
        }
        if state.queue_locked_for(&job.tenant, &job.queue, job.exclusive) {
            return Err(MillworkError::QueueLocked {
                queue: job.queue.clone(),
            });
        }

        let ids_key = (job.tenant.clone(), job.queue.clone());
        let replaced = state
            .ids
            .get(&ids_key)
            .map(|ids| ids.contains(&job.id))
            .unwrap_or(false);

        let mut record = job.clone();
        record.count = 0;
        if replaced {
            record.count = state.jobs.get(&fp).map(|prior| prior.count).unwrap_or(0);
            state.scheduled.remove(&fp);
            if let Some(queue) = state.pending.get_mut(&job.tenant) {
                queue.retain(|candidate| candidate != &fp);
            }
        }

        if record.run_at <= now {
            state
                .pending
                .entry(job.tenant.clone())
                .or_default()
                .push_back(fp.clone());
            state.send_wake(&job.tenant);
        } else {
            let seq = state.next_seq();
            state.scheduled.insert(fp.clone(), (record.run_at, seq));
        }
        state.ids.entry(ids_key).or_default().insert(job.id.clone());
        state.send_activity(ActivityKind::Enqueued, &record);
        state.jobs.insert(fp, record);

        Ok(if replaced {
            EnqueueOutcome::Replaced
        } else {
            EnqueueOutcome::Created
        })
    }

    async fn promote_due(&self, limit: u64) -> Result<u64> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();

        let mut due: Vec<(i64, u64, String)> = state
            .scheduled
            .iter()
            .filter(|(_, (run_at, _))| *run_at <= now)
            .map(|(fp, (run_at, seq))| (*run_at, *seq, fp.clone()))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut moved = 0;
        for (_, _, fp) in due {
            state.scheduled.remove(&fp);
            let Some(tenant) = state.jobs.get(&fp).map(|job| job.tenant.clone()) else {
                continue;
            };
            state
                .pending
                .entry(tenant.clone())
                .or_default()
                .push_back(fp);
            state.send_wake(&tenant);
            moved += 1;
        }
        Ok(moved)
    }

    async fn claim(&self, tenant: &str, stale_after: Duration) -> Result<ClaimOutcome> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();

        loop {
            let Some(fp) = state
                .pending
                .get_mut(tenant)
                .and_then(|queue| queue.pop_front())
            else {
                return Ok(ClaimOutcome::Empty);
            };
            // a deleted job may leave its fingerprint behind; keep popping
            if !state.jobs.contains_key(&fp) {
                continue;
            }

            let (queue_name, exclusive) = {
                let job = &state.jobs[&fp];
                (job.queue.clone(), job.exclusive)
            };
            if state.queue_locked_for(tenant, &queue_name, exclusive) {
                state
                    .pending
                    .get_mut(tenant)
                    .expect("pending queue exists")
                    .push_front(fp);
                return Ok(ClaimOutcome::Blocked);
            }

            let job = state.jobs.get_mut(&fp).expect("job record exists");
            job.count += 1;
            let snapshot = job.clone();
            let deadline = now + stale_after.as_millis() as i64;
            state.processing.insert(fp.clone(), deadline);
            state.send_activity(ActivityKind::Claimed, &snapshot);

            let token = AckToken {
                fingerprint: JobFingerprint::from_raw(fp),
                count: snapshot.count,
            };
            return Ok(ClaimOutcome::Claimed(ClaimedJob {
                job: snapshot,
                token,
            }));
        }
    }

    async fn acknowledge(&self, token: &AckToken, opts: AckOptions) -> Result<AckOutcome> {
        let fp = token.fingerprint.as_str().to_string();
        let mut state = self.state.lock().unwrap();

        let current = match state.jobs.get(&fp) {
            Some(job) if job.count == token.count => job.clone(),
            _ => return Ok(AckOutcome::StaleAck),
        };
        if !state.processing.contains_key(&fp) {
            return Ok(AckOutcome::StaleAck);
        }

        let reschedulable = !opts.dont_reschedule
            && current.schedule.is_some()
            && current
                .max_times
                .map(|max| current.count < max)
                .unwrap_or(true);

        if reschedulable {
            let schedule = current.schedule.as_ref().expect("schedule present");
            let last_fire = current.run_at;
            if let Some(next_run_at) =
                self.schedules
                    .next_fire(&schedule.schedule_type, last_fire, &schedule.meta)
            {
                state.processing.remove(&fp);
                let seq = state.next_seq();
                let job = state.jobs.get_mut(&fp).expect("job record exists");
                job.run_at = next_run_at;
                job.schedule.as_mut().expect("schedule present").last_fire = Some(last_fire);
                let snapshot = job.clone();
                state.scheduled.insert(fp, (next_run_at, seq));
                state.send_activity(ActivityKind::Rescheduled, &snapshot);
                return Ok(AckOutcome::Rescheduled { next_run_at });
            }
        }

        state.remove_everywhere(&fp);
        state.send_activity(ActivityKind::Acknowledged, &current);
        Ok(AckOutcome::Finalized)
    }

    async fn stale_claims(&self) -> Result<Vec<JobFingerprint>> {
        let now = self.now();
        let state = self.state.lock().unwrap();
        let mut stale: Vec<(i64, String)> = state
            .processing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(fp, deadline)| (*deadline, fp.clone()))
            .collect();
        stale.sort();
        Ok(stale
            .into_iter()
            .map(|(_, fp)| JobFingerprint::from_raw(fp))
            .collect())
    }

    async fn report_stale(&self, fingerprint: &JobFingerprint) -> Result<StaleOutcome> {
        let now = self.now();
        let fp = fingerprint.as_str().to_string();
        let mut state = self.state.lock().unwrap();

        match state.processing.get(&fp) {
            Some(deadline) if *deadline <= now => {}
            _ => return Ok(StaleOutcome::NotFound),
        }
        if !state.jobs.contains_key(&fp) {
            state.processing.remove(&fp);
            return Ok(StaleOutcome::NotFound);
        }

        state.processing.remove(&fp);
        let current = state.jobs[&fp].clone();
        if current.has_retry_left() {
            let delay = current.retry[(current.count - 1) as usize];
            let next_retry_at = now + delay;
            let seq = state.next_seq();
            let job = state.jobs.get_mut(&fp).expect("job record exists");
            job.run_at = next_retry_at;
            let snapshot = job.clone();
            state.scheduled.insert(fp, (next_retry_at, seq));
            state.send_activity(ActivityKind::Rescheduled, &snapshot);
            return Ok(StaleOutcome::Retried { next_retry_at });
        }

        state.remove_everywhere(&fp);
        state.send_activity(ActivityKind::Failed, &current);
        Ok(StaleOutcome::Failed {
            tenant: current.tenant,
            queue: current.queue,
            id: current.id,
        })
    }

    async fn find_by_id(&self, tenant: &str, queue: &str, id: &str) -> Result<Option<Job>> {
        let fp = JobFingerprint::compose(tenant, queue, id);
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(fp.as_str()).cloned())
    }

    async fn delete(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        let fp = JobFingerprint::compose(tenant, queue, id);
        let mut state = self.state.lock().unwrap();
        let existed = state.jobs.contains_key(fp.as_str());
        state.remove_everywhere(fp.as_str());
        Ok(existed)
    }

    async fn invoke(&self, tenant: &str, queue: &str, id: &str) -> Result<bool> {
        let now = self.now();
        let fp = JobFingerprint::compose(tenant, queue, id).as_str().to_string();
        let mut state = self.state.lock().unwrap();

        if state.scheduled.remove(&fp).is_none() {
            return Ok(false);
        }
        let Some(job) = state.jobs.get_mut(&fp) else {
            return Ok(false);
        };
        job.run_at = now;
        let tenant = job.tenant.clone();
        state.pending.entry(tenant.clone()).or_default().push_back(fp);
        state.send_wake(&tenant);
        Ok(true)
    }

    async fn pending_count(&self, tenant: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.pending.get(tenant).map(VecDeque::len).unwrap_or(0) as u64)
    }

    async fn scheduled_count(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.scheduled.len() as u64)
    }

    async fn subscribe_wake(&self, tenants: &[String]) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state
            .wake_subs
            .push((tenants.iter().cloned().collect(), tx));
        Ok(rx)
    }

    async fn subscribe_activity(&self) -> Result<mpsc::UnboundedReceiver<ActivityEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.activity_subs.push(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wake_subs.clear();
        state.activity_subs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_at(epoch_ms: i64) -> (MemoryRepository, MockClock) {
        let clock = MockClock::at(epoch_ms);
        (MemoryRepository::with_clock(clock.clone()), clock)
    }

    /// A live fingerprint must be in exactly one of the three sets.
    async fn assert_exactly_one_set(repo: &MemoryRepository, fp: &str) {
        let state = repo.state.lock().unwrap();
        assert!(state.jobs.contains_key(fp), "job record missing for {}", fp);
        let in_scheduled = state.scheduled.contains_key(fp) as u32;
        let in_pending = state
            .pending
            .values()
            .any(|queue| queue.iter().any(|candidate| candidate == fp))
            as u32;
        let in_processing = state.processing.contains_key(fp) as u32;
        assert_eq!(
            in_scheduled + in_pending + in_processing,
            1,
            "{} placed in {} sets",
            fp,
            in_scheduled + in_pending + in_processing
        );
    }

    #[tokio::test]
    async fn test_due_job_goes_to_pending() {
        let (repo, _) = repo_at(10_000);
        let job = Job::new("q", "p").with_id("a").with_run_at(10_000);
        assert_eq!(repo.enqueue(&job).await.unwrap(), EnqueueOutcome::Created);
        assert_eq!(repo.pending_count("").await.unwrap(), 1);
        assert_eq!(repo.scheduled_count().await.unwrap(), 0);
        assert_exactly_one_set(&repo, ":q:a").await;
    }

    #[tokio::test]
    async fn test_future_job_goes_to_scheduled_then_promotes() {
        let (repo, clock) = repo_at(10_000);
        let job = Job::new("q", "p").with_id("a").with_run_at(12_000);
        repo.enqueue(&job).await.unwrap();
        assert_eq!(repo.scheduled_count().await.unwrap(), 1);

        assert_eq!(repo.promote_due(10).await.unwrap(), 0);
        clock.advance_ms(2_000);
        assert_eq!(repo.promote_due(10).await.unwrap(), 1);
        assert_eq!(repo.pending_count("").await.unwrap(), 1);
        assert_exactly_one_set(&repo, ":q:a").await;
    }

    #[tokio::test]
    async fn test_promotion_order_by_run_at_then_insertion() {
        let (repo, clock) = repo_at(0);
        for (id, run_at) in [("late", 3_000), ("early-b", 1_000), ("early-a", 1_000)] {
            repo.enqueue(&Job::new("q", "p").with_id(id).with_run_at(run_at))
                .await
                .unwrap();
        }
        clock.advance_ms(5_000);
        repo.promote_due(10).await.unwrap();

        let order: Vec<String> = {
            let state = repo.state.lock().unwrap();
            state.pending[""].iter().cloned().collect()
        };
        assert_eq!(order, vec![":q:early-b", ":q:early-a", ":q:late"]);
    }

    #[tokio::test]
    async fn test_replace_repositions_the_job() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("q", "p1").with_id("a").with_run_at(20_000))
            .await
            .unwrap();
        assert_eq!(repo.scheduled_count().await.unwrap(), 1);

        // replacing with a due run_at moves it straight to pending
        assert_eq!(
            repo.enqueue(&Job::new("q", "p2").with_id("a").with_run_at(0))
                .await
                .unwrap(),
            EnqueueOutcome::Replaced
        );
        assert_eq!(repo.scheduled_count().await.unwrap(), 0);
        assert_eq!(repo.pending_count("").await.unwrap(), 1);

        let found = repo.find_by_id("", "q", "a").await.unwrap().unwrap();
        assert_eq!(found.payload, "p2");
        assert_exactly_one_set(&repo, ":q:a").await;
    }

    #[tokio::test]
    async fn test_enqueue_rejected_while_processing() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("q", "p").with_id("a")).await.unwrap();
        let ClaimOutcome::Claimed(_) = repo.claim("", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected claim");
        };

        let err = repo
            .enqueue(&Job::new("q", "p2").with_id("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MillworkError::QueueLocked { .. }));
    }

    #[tokio::test]
    async fn test_exclusive_enqueue_locked_while_queue_busy() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("solo", "p").with_id("a").as_exclusive())
            .await
            .unwrap();
        let ClaimOutcome::Claimed(_) = repo.claim("", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected claim");
        };

        let err = repo
            .enqueue(&Job::new("solo", "p").with_id("b").as_exclusive())
            .await
            .unwrap_err();
        assert!(matches!(err, MillworkError::QueueLocked { .. }));
    }

    #[tokio::test]
    async fn test_exclusive_claim_blocked_while_queue_busy() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("solo", "p").with_id("a").as_exclusive())
            .await
            .unwrap();
        repo.enqueue(&Job::new("solo", "p").with_id("b").as_exclusive())
            .await
            .unwrap();

        let first = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert!(matches!(
            repo.claim("", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Blocked
        ));

        repo.acknowledge(&first.token, AckOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            repo.claim("", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_exclusive_occupant_blocks_plain_claim() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("solo", "p").with_id("guard").as_exclusive())
            .await
            .unwrap();
        repo.enqueue(&Job::new("other", "p").with_id("bystander"))
            .await
            .unwrap();
        repo.enqueue(&Job::new("solo", "p").with_id("follower"))
            .await
            .unwrap();

        let guard = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(guard.job.id, "guard");

        // a different queue is unaffected by the exclusive occupant
        let bystander = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(bystander.job.id, "bystander");

        // the plain follower on the exclusive occupant's queue is not
        assert!(matches!(
            repo.claim("", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Blocked
        ));

        repo.acknowledge(&guard.token, AckOptions::default())
            .await
            .unwrap();
        let follower = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(follower.job.id, "follower");
    }

    #[tokio::test]
    async fn test_exclusive_claim_blocked_by_plain_occupant() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("solo", "p").with_id("plain-first"))
            .await
            .unwrap();
        repo.enqueue(&Job::new("solo", "p").with_id("locker").as_exclusive())
            .await
            .unwrap();

        let plain = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(plain.job.id, "plain-first");

        assert!(matches!(
            repo.claim("", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Blocked
        ));

        repo.acknowledge(&plain.token, AckOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            repo.claim("", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_locked_by_exclusive_occupant() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("solo", "p").with_id("guard").as_exclusive())
            .await
            .unwrap();
        let ClaimOutcome::Claimed(_) = repo.claim("", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected claim");
        };

        // even a plain newcomer is refused while the occupant is exclusive
        let err = repo
            .enqueue(&Job::new("solo", "p").with_id("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, MillworkError::QueueLocked { .. }));
    }

    #[tokio::test]
    async fn test_exclusive_enqueue_locked_by_plain_occupant() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("open", "p").with_id("plain"))
            .await
            .unwrap();
        let ClaimOutcome::Claimed(_) = repo.claim("", Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected claim");
        };

        let err = repo
            .enqueue(&Job::new("open", "p").with_id("locker").as_exclusive())
            .await
            .unwrap_err();
        assert!(matches!(err, MillworkError::QueueLocked { .. }));
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("q", "p").with_id("a")).await.unwrap();
        let claimed = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };

        assert_eq!(
            repo.acknowledge(&claimed.token, AckOptions::default())
                .await
                .unwrap(),
            AckOutcome::Finalized
        );
        assert_eq!(
            repo.acknowledge(&claimed.token, AckOptions::default())
                .await
                .unwrap(),
            AckOutcome::StaleAck
        );
    }

    #[tokio::test]
    async fn test_late_ack_after_stale_reclaim_is_dropped() {
        let (repo, clock) = repo_at(0);
        repo.enqueue(&Job::new("q", "p").with_id("a").with_retry(vec![100]))
            .await
            .unwrap();
        let claimed = match repo.claim("", Duration::from_millis(50)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };

        clock.advance_ms(60);
        assert_eq!(
            repo.report_stale(&claimed.token.fingerprint).await.unwrap(),
            StaleOutcome::Retried {
                next_retry_at: 60 + 100
            }
        );

        // the worker finally answers, but the reclaim owns the job now
        assert_eq!(
            repo.acknowledge(&claimed.token, AckOptions::default())
                .await
                .unwrap(),
            AckOutcome::StaleAck
        );
        assert_exactly_one_set(&repo, ":q:a").await;
    }

    #[tokio::test]
    async fn test_repeating_job_reschedules_with_last_fire() {
        let (repo, _) = repo_at(0);
        repo.enqueue(
            &Job::new("q", "p")
                .with_id("a")
                .with_run_at(0)
                .with_schedule("every", "1000"),
        )
        .await
        .unwrap();
        let claimed = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };

        assert_eq!(
            repo.acknowledge(&claimed.token, AckOptions::default())
                .await
                .unwrap(),
            AckOutcome::Rescheduled { next_run_at: 1_000 }
        );
        let job = repo.find_by_id("", "q", "a").await.unwrap().unwrap();
        assert_eq!(job.run_at, 1_000);
        assert_eq!(job.schedule.unwrap().last_fire, Some(0));
        assert_exactly_one_set(&repo, ":q:a").await;
    }

    #[tokio::test]
    async fn test_max_times_terminates_repeats() {
        let (repo, clock) = repo_at(0);
        repo.enqueue(
            &Job::new("q", "p")
                .with_id("a")
                .with_run_at(0)
                .with_schedule("every", "10")
                .with_max_times(2),
        )
        .await
        .unwrap();

        for round in 0..2 {
            repo.promote_due(10).await.unwrap();
            let claimed = match repo.claim("", Duration::from_secs(60)).await.unwrap() {
                ClaimOutcome::Claimed(claimed) => claimed,
                other => panic!("round {}: expected claim, got {:?}", round, other),
            };
            repo.acknowledge(&claimed.token, AckOptions::default())
                .await
                .unwrap();
            clock.advance_ms(20);
        }

        assert!(repo.find_by_id("", "q", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invoke_force_promotes() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("q", "p").with_id("a").with_run_at(99_000))
            .await
            .unwrap();

        assert!(repo.invoke("", "q", "a").await.unwrap());
        assert_eq!(repo.pending_count("").await.unwrap(), 1);
        // only scheduled jobs can be invoked
        assert!(!repo.invoke("", "q", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_from_any_set() {
        let (repo, _) = repo_at(0);
        repo.enqueue(&Job::new("q", "p").with_id("pending-job"))
            .await
            .unwrap();
        repo.enqueue(&Job::new("q", "p").with_id("scheduled-job").with_run_at(99_000))
            .await
            .unwrap();

        assert!(repo.delete("", "q", "pending-job").await.unwrap());
        assert!(repo.delete("", "q", "scheduled-job").await.unwrap());
        assert!(!repo.delete("", "q", "missing").await.unwrap());
        assert_eq!(repo.pending_count("").await.unwrap(), 0);
        assert_eq!(repo.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wake_sent_on_enqueue_and_promotion() {
        let (repo, clock) = repo_at(0);
        let mut wake = repo.subscribe_wake(&["t1".to_string()]).await.unwrap();

        repo.enqueue(&Job::new("q", "p").with_id("a").with_tenant("t1"))
            .await
            .unwrap();
        assert_eq!(wake.try_recv().unwrap(), "t1");

        repo.enqueue(
            &Job::new("q", "p")
                .with_id("b")
                .with_tenant("t1")
                .with_run_at(1_000),
        )
        .await
        .unwrap();
        assert!(wake.try_recv().is_err());
        clock.advance_ms(1_000);
        repo.promote_due(10).await.unwrap();
        assert_eq!(wake.try_recv().unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_activity_stream_sees_lifecycle() {
        let (repo, clock) = repo_at(0);
        let mut activity = repo.subscribe_activity().await.unwrap();

        repo.enqueue(&Job::new("q", "p").with_id("a").with_retry(vec![50]))
            .await
            .unwrap();
        let claimed = match repo.claim("", Duration::from_millis(10)).await.unwrap() {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        clock.advance_ms(20);
        repo.report_stale(&claimed.token.fingerprint).await.unwrap();

        let kinds: Vec<ActivityKind> = [
            activity.try_recv().unwrap(),
            activity.try_recv().unwrap(),
            activity.try_recv().unwrap(),
        ]
        .into_iter()
        .map(|event| event.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                ActivityKind::Enqueued,
                ActivityKind::Claimed,
                ActivityKind::Rescheduled
            ]
        );
    }
}
