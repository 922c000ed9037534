pub mod activity;
pub mod clock;
pub mod config;
pub mod distributor;
pub mod error;
pub mod job;
pub mod producer;
pub mod repository;
pub mod schedule;
pub mod stale;
pub mod worker;

pub use activity::{Activity, ActivityHandler};
pub use config::{CheckMode, StaleCheckerConfig, WorkerConfig};
pub use distributor::{FetchOutcome, JobDistributor, TenantSource, Timer};
pub use error::MillworkError;
pub use job::{AckToken, Job, JobFingerprint, JobSchedule};
pub use producer::{EnqueueReceipt, Producer};
pub use repository::{AckOptions, AckOutcome, ActivityEvent, ClaimedJob, EnqueueOutcome};
pub use schedule::ScheduleMap;
pub use stale::{JobTimedOutError, StaleChecker};
pub use worker::{Acknowledger, JobProcessor, Worker};

pub type Result<T> = std::result::Result<T, MillworkError>;
