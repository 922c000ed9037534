//! Schedule registry for repeating jobs.
//!
//! A [`ScheduleMap`] maps schedule-type names to pure next-fire-time
//! functions `(last_fire_ms, meta) -> Option<next_fire_ms>`. Returning `None`
//! terminates the recurrence. The standard map ships `"every"` (fixed
//! interval, meta = interval in ms) and `"cron"` (meta = cron expression,
//! evaluated in UTC).

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// A pure next-fire-time function.
///
/// Must be total over valid `(last_fire, meta)` inputs and deterministic;
/// the queue may re-evaluate it during acknowledge retries.
pub type ScheduleFn = Arc<dyn Fn(i64, &str) -> Option<i64> + Send + Sync>;

/// Registry of named schedule functions.
///
/// # Examples
///
/// ```rust
/// use millwork::schedule::ScheduleMap;
///
/// let map = ScheduleMap::standard();
/// assert_eq!(map.next_fire("every", 10_000, "500"), Some(10_500));
/// ```
#[derive(Clone)]
pub struct ScheduleMap {
    entries: HashMap<String, ScheduleFn>,
}

impl ScheduleMap {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The registry with the built-in `"every"` and `"cron"` types.
    pub fn standard() -> Self {
        let mut map = Self::new();
        map.register("every", |last_fire, meta| {
            let interval: i64 = meta.parse().ok()?;
            if interval <= 0 {
                return None;
            }
            Some(last_fire + interval)
        });
        map.register("cron", |last_fire, meta| next_cron_fire(last_fire, meta));
        map
    }

    /// Register a schedule function under a name, replacing any previous
    /// entry.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(i64, &str) -> Option<i64> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(f));
    }

    /// Compute the next fire time, or `None` to terminate the recurrence.
    ///
    /// An unknown schedule type terminates (with a warning) rather than
    /// erroring: the job finished its current run and there is no way to
    /// place the next one.
    pub fn next_fire(&self, schedule_type: &str, last_fire: i64, meta: &str) -> Option<i64> {
        match self.entries.get(schedule_type) {
            Some(f) => f(last_fire, meta),
            None => {
                warn!(schedule_type, "unknown schedule type, not rescheduling");
                None
            }
        }
    }

    /// Whether a schedule type is registered.
    pub fn contains(&self, schedule_type: &str) -> bool {
        self.entries.contains_key(schedule_type)
    }
}

impl Default for ScheduleMap {
    fn default() -> Self {
        Self::standard()
    }
}

/// Next execution of a cron expression strictly after `last_fire`, in UTC.
fn next_cron_fire(last_fire: i64, expression: &str) -> Option<i64> {
    let schedule = Schedule::from_str(expression).ok()?;
    let after: DateTime<Utc> = DateTime::from_timestamp_millis(last_fire)?;
    let next = schedule.after(&after).next()?;
    Some(next.timestamp_millis())
}
