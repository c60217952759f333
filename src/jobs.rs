//! Built-in job types.

use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobContext, JobError, JobRegistry, JobType};

pub const DUMMY_JOB: &str = "jobhive.jobs.DummyJob";
pub const ERROR_JOB: &str = "jobhive.jobs.ErrorJob";
pub const DEFER_JOB: &str = "jobhive.jobs.DeferJob";

const AUTHOR: &str = "jobhive";

pub fn register_builtin(registry: &mut JobRegistry) -> Result<()> {
    registry.register(JobType::new(DUMMY_JOB, AUTHOR, || {
        Ok(Box::new(DummyJob) as Box<dyn Job>)
    }))?;
    registry.register(JobType::new(ERROR_JOB, AUTHOR, || {
        Ok(Box::new(ErrorJob) as Box<dyn Job>)
    }))?;
    registry.register(JobType::new(DEFER_JOB, AUTHOR, || {
        Ok(Box::new(DeferJob) as Box<dyn Job>)
    }))?;
    Ok(())
}

fn f64_arg(args: &Map<String, Value>, key: &str, default: f64) -> f64 {
    args.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Sleeps for `sleep` seconds (default 1), reporting progress every
/// `step` seconds.
pub struct DummyJob;

impl Job for DummyJob {
    fn execute(&mut self, ctx: &mut JobContext<'_>, args: &Map<String, Value>) -> std::result::Result<(), JobError> {
        let total = f64_arg(args, "sleep", 1.0).max(0.0);
        let step = f64_arg(args, "step", 0.5).max(0.01);
        let mut elapsed = 0.0;
        while elapsed < total {
            let nap = step.min(total - elapsed);
            std::thread::sleep(Duration::from_secs_f64(nap));
            elapsed += nap;
            ctx.progress(elapsed / total, format!("slept {:.1}s of {:.1}s", elapsed, total))?;
        }
        Ok(())
    }
}

/// Always fails, with the `message` argument if given.
pub struct ErrorJob;

impl Job for ErrorJob {
    fn execute(&mut self, _ctx: &mut JobContext<'_>, args: &Map<String, Value>) -> std::result::Result<(), JobError> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("expected failure");
        Err(JobError::failed(message))
    }
}

/// Always defers.
pub struct DeferJob;

impl Job for DeferJob {
    fn execute(&mut self, ctx: &mut JobContext<'_>, _args: &Map<String, Value>) -> std::result::Result<(), JobError> {
        Err(ctx.defer("not ready yet"))
    }
}
