//! Scheduler daemon: enqueues cron-scheduled job types.
//!
//! Each tick looks at the interval between the last tick (the watermark,
//! persisted in the store) and now. A job type whose next fire time after the
//! watermark falls inside that interval is enqueued once, no matter how many
//! fire times were missed.

pub mod cron;

pub use cron::{CronError, CronSchedule};

use chrono::{DateTime, Utc};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::daemon::Daemon;
use crate::error::{QueueError, Result};
use crate::job::{JobId, JobRegistry, Origin};
use crate::store::QueueStore;

pub const SCHEDULER_KIND: &str = "scheduler";

pub struct Scheduler {
    store: Arc<QueueStore>,
    registry: Arc<JobRegistry>,
    config: Arc<QueueConfig>,
    identity: String,
    interval: Duration,
    schedules: Vec<(String, CronSchedule)>,
    watermark: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<QueueStore>,
        registry: Arc<JobRegistry>,
        config: Arc<QueueConfig>,
        identity: impl Into<String>,
    ) -> Self {
        let interval = Duration::from_secs_f64(config.scheduler.interval.max(0.001));
        Self {
            store,
            registry,
            config,
            identity: identity.into(),
            interval,
            schedules: Vec::new(),
            watermark: None,
        }
    }

    /// Snapshot of the scheduled job types. Invalid expressions are skipped.
    pub fn load_schedules(&mut self) -> Result<()> {
        self.schedules.clear();
        for name in self.registry.names() {
            let Some(expression) = self.registry.schedule_of(name, &self.config) else {
                continue;
            };
            match CronSchedule::parse(&expression) {
                Ok(schedule) => {
                    tracing::info!(name, schedule = %schedule, "Scheduled job");
                    self.schedules.push((name.to_string(), schedule));
                }
                Err(e) => {
                    tracing::error!(name, schedule = %expression, error = %e, "Invalid schedule, skipped");
                }
            }
        }
        self.watermark = self.store.schedule_watermark()?;
        Ok(())
    }

    pub fn schedules(&self) -> &[(String, CronSchedule)] {
        &self.schedules
    }

    /// Enqueues every job type due in `(watermark, now]` and advances the
    /// watermark to `now`.
    pub fn schedule(&mut self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let since = self.watermark.unwrap_or(now);
        let mut enqueued = Vec::new();
        for (name, schedule) in &self.schedules {
            let Some(fire_at) = schedule.next_after(since) else {
                continue;
            };
            if fire_at > now {
                continue;
            }
            let result = self
                .registry
                .prepare(name, Map::new(), &self.config)
                .and_then(|job| self.store.enqueue(&job, &Origin::current(now)));
            match result {
                Ok(id) => {
                    tracing::info!(job_id = %id, name = %name, fire_at = %fire_at, "Enqueued scheduled job");
                    enqueued.push(id);
                }
                Err(QueueError::JobExists { .. }) => {
                    tracing::error!(name = %name, "Scheduled job is still enqueued, skipped");
                }
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "Failed to enqueue scheduled job");
                }
            }
        }
        self.watermark = Some(now);
        self.store.set_schedule_watermark(now)?;
        Ok(enqueued)
    }
}

impl Daemon for Scheduler {
    fn kind(&self) -> &'static str {
        SCHEDULER_KIND
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn plan(&self) -> Vec<(&'static str, Duration)> {
        vec![("schedule", self.interval)]
    }

    fn startup(&mut self, _now: DateTime<Utc>) -> Result<()> {
        self.load_schedules()
    }

    fn run_step(&mut self, step: &str, now: DateTime<Utc>) -> Result<()> {
        match step {
            "schedule" => self.schedule(now).map(|_| ()),
            other => Err(QueueError::Usage(format!("unknown scheduler step [{}]", other))),
        }
    }
}
