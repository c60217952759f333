use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::JobOverrides;

/// Location and tuning of the shared SQLite database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// How long a writer waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("jobhive.db"),
            busy_timeout_ms: 5000,
        }
    }
}

/// Interval of each worker step, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionPlan {
    pub work_jobs: f64,
    pub remove_jobs: f64,
    pub flag_jobs: f64,
    pub collect_stats: f64,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self {
            work_jobs: 1.0,
            remove_jobs: 3.0,
            flag_jobs: 3.0,
            collect_stats: 20.0,
        }
    }
}

impl ExecutionPlan {
    pub fn steps(&self) -> Vec<(&'static str, Duration)> {
        vec![
            ("work_jobs", secs_f64(self.work_jobs)),
            ("remove_jobs", secs_f64(self.remove_jobs)),
            ("flag_jobs", secs_f64(self.flag_jobs)),
            ("collect_stats", secs_f64(self.collect_stats)),
        ]
    }
}

/// Command used to spawn job processes.
///
/// Without a program the running binary is re-executed with its `exec`
/// subcommand.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Defaults to the hostname
    pub identity: Option<String>,
    pub execution_plan: ExecutionPlan,
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub identity: Option<String>,
    pub interval: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            identity: None,
            interval: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// A registration without heartbeat for this long counts as dead
    pub alive_timeout: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { alive_timeout: 60 }
    }
}

impl DaemonConfig {
    pub fn alive_timeout(&self) -> Duration {
        Duration::from_secs(self.alive_timeout)
    }
}

/// Top-level configuration, usually read from a TOML file.
///
/// `job` holds the global job defaults, `jobs` the per-type sections keyed by
/// qualified job name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub daemon: DaemonConfig,
    pub job: JobOverrides,
    pub jobs: HashMap<String, JobOverrides>,
}

impl QueueConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, seconds) in self
            .worker
            .execution_plan
            .steps()
            .into_iter()
            .map(|(n, d)| (n, d.as_secs_f64()))
            .chain(std::iter::once(("scheduler.interval", self.scheduler.interval)))
        {
            if seconds <= 0.0 {
                return Err(QueueError::Config(format!("[{}] must be > 0", name)));
            }
        }
        Ok(())
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = path.into();
        self
    }

    pub fn with_worker_identity(mut self, identity: impl Into<String>) -> Self {
        self.worker.identity = Some(identity.into());
        self
    }
}

fn secs_f64(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}
