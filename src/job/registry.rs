use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::context::JobContext;
use crate::job::document::NewJob;
use crate::job::property::{JobOverrides, JobProperties};

/// Errors raised by job implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Not a failure: the job asks to be run again later.
    #[error("{0}")]
    Deferred(String),

    #[error("{0}")]
    Failed(String),

    #[error("execute() is not implemented")]
    NotImplemented,

    #[error("cannot construct job: {0}")]
    Construction(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    /// Short exception name recorded in `last_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Deferred(_) => "JobDeferred",
            JobError::Failed(_) => "JobFailed",
            JobError::NotImplemented => "NotImplemented",
            JobError::Construction(_) => "JobConstruction",
        }
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        JobError::Failed(err.to_string())
    }
}

/// The author contract of a job type.
pub trait Job: Send {
    fn execute(
        &mut self,
        ctx: &mut JobContext<'_>,
        args: &Map<String, Value>,
    ) -> std::result::Result<(), JobError> {
        let _ = (ctx, args);
        Err(JobError::NotImplemented)
    }
}

pub type JobFactory = Arc<dyn Fn() -> std::result::Result<Box<dyn Job>, JobError> + Send + Sync>;

/// A registered job type: qualified name, author, type-level property
/// constants and a constructor.
#[derive(Clone)]
pub struct JobType {
    pub name: String,
    pub author: String,
    pub defaults: JobOverrides,
    factory: JobFactory,
}

impl JobType {
    pub fn new<F>(name: impl Into<String>, author: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            author: author.into(),
            defaults: JobOverrides::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_defaults(mut self, defaults: JobOverrides) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn instantiate(&self) -> std::result::Result<Box<dyn Job>, JobError> {
        (self.factory)()
    }
}

impl std::fmt::Debug for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobType")
            .field("name", &self.name)
            .field("author", &self.author)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Explicit map of job type names to their definitions.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    types: BTreeMap<String, JobType>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType) -> Result<()> {
        if job_type.name.trim().is_empty() {
            return Err(QueueError::validation("job type name must not be empty"));
        }
        if job_type.author.trim().is_empty() {
            return Err(QueueError::validation(format!(
                "[{}] author must not be empty",
                job_type.name
            )));
        }
        JobProperties::resolve(&[&job_type.defaults])?;
        if self.types.contains_key(&job_type.name) {
            return Err(QueueError::conflict(format!(
                "job type [{}] already registered",
                job_type.name
            )));
        }
        self.types.insert(job_type.name.clone(), job_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobType> {
        self.types.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|k| k.as_str())
    }

    pub fn instantiate(&self, name: &str) -> std::result::Result<Box<dyn Job>, JobError> {
        match self.types.get(name) {
            Some(job_type) => job_type.instantiate(),
            None => Err(JobError::Construction(format!("unknown job type [{}]", name))),
        }
    }

    /// Resolves properties for an enqueue request and builds the job.
    ///
    /// Precedence, lowest first: `[job]` config section, `[jobs."<name>"]`
    /// section, type-level defaults, enqueue parameters.
    pub fn prepare(
        &self,
        name: &str,
        params: Map<String, Value>,
        config: &QueueConfig,
    ) -> Result<NewJob> {
        let job_type = self
            .get(name)
            .ok_or_else(|| QueueError::validation(format!("unknown job type [{}]", name)))?;
        let (enqueue, args) = JobOverrides::from_enqueue_params(params)?;
        let empty = JobOverrides::default();
        let section = config.jobs.get(name).unwrap_or(&empty);
        let props =
            JobProperties::resolve(&[&config.job, section, &job_type.defaults, &enqueue])?;
        NewJob::new(name, args, props)
    }

    /// The cron schedule of a job type. A config section entry overrides the
    /// type-level constant.
    pub fn schedule_of(&self, name: &str, config: &QueueConfig) -> Option<String> {
        let job_type = self.get(name)?;
        config
            .jobs
            .get(name)
            .and_then(|section| section.schedule.clone())
            .or_else(|| job_type.defaults.schedule.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl Job for Noop {}

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobType::new("demo.Noop", "tester", || Ok(Box::new(Noop) as Box<dyn Job>))
                    .with_defaults(JobOverrides {
                        priority: Some(3),
                        attempts: Some(2),
                        ..Default::default()
                    }),
            )
            .unwrap();
        registry
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let mut registry = registry();
        let err = registry
            .register(JobType::new("demo.Noop", "tester", || Ok(Box::new(Noop) as Box<dyn Job>)))
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[test]
    fn author_is_required() {
        let mut registry = JobRegistry::new();
        let err = registry
            .register(JobType::new("demo.Anon", "", || Ok(Box::new(Noop) as Box<dyn Job>)))
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn prepare_applies_cascade() {
        let registry = registry();
        let mut config = QueueConfig::default();
        config.job.priority = Some(1);
        config.job.defer_time = Some(10);
        config.jobs.insert(
            "demo.Noop".to_string(),
            JobOverrides {
                attempts: Some(5),
                defer_time: Some(20),
                ..Default::default()
            },
        );

        let job = registry
            .prepare("demo.Noop", params(json!({"x": 1})), &config)
            .unwrap();
        assert_eq!(job.properties().priority, 3);
        assert_eq!(job.properties().attempts, 2);
        assert_eq!(job.properties().defer_time, 20);

        let job = registry
            .prepare("demo.Noop", params(json!({"priority": 9})), &config)
            .unwrap();
        assert_eq!(job.properties().priority, 9);
        assert!(job.args().is_empty());
    }

    #[test]
    fn unknown_type_cannot_be_prepared() {
        let registry = registry();
        let err = registry
            .prepare("demo.Missing", Map::new(), &QueueConfig::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn default_execute_is_not_implemented() {
        let registry = registry();
        assert!(registry.instantiate("demo.Noop").is_ok());
        assert!(matches!(
            registry.instantiate("demo.Missing"),
            Err(JobError::Construction(_))
        ));
    }

    #[test]
    fn schedule_from_config_overrides_type() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobType::new("demo.Cron", "tester", || Ok(Box::new(Noop) as Box<dyn Job>))
                    .with_defaults(JobOverrides {
                        schedule: Some("0 * * * *".to_string()),
                        ..Default::default()
                    }),
            )
            .unwrap();
        let mut config = QueueConfig::default();
        assert_eq!(
            registry.schedule_of("demo.Cron", &config).as_deref(),
            Some("0 * * * *")
        );
        config.jobs.insert(
            "demo.Cron".to_string(),
            JobOverrides {
                schedule: Some("*/5 * * * *".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            registry.schedule_of("demo.Cron", &config).as_deref(),
            Some("*/5 * * * *")
        );
    }
}
