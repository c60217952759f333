//! Child side of the process boundary: runs one job and reports its outcome.

use chrono::Utc;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt::Write;
use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Once;

use crate::error::{QueueError, Result};
use crate::job::{JobContext, JobError, JobId, JobRegistry, JobState, LastError};
use crate::store::QueueStore;

/// Reads the job id handed over on stdin.
pub fn read_job_id(reader: impl BufRead) -> Result<JobId> {
    let line = reader
        .lines()
        .next()
        .ok_or_else(|| QueueError::Usage("expected a job id on stdin".to_string()))??;
    line.parse()
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a hook in front of the current panic hook that keeps the panic
/// location and a backtrace for the panicking thread.
fn install_panic_capture() {
    PANIC_HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mut detail = info.to_string();
            let backtrace = Backtrace::force_capture();
            let _ = write!(&mut detail, "\nbacktrace:\n{backtrace}");
            PANIC_TRACE.with(|trace| {
                if let Ok(mut slot) = trace.try_borrow_mut() {
                    *slot = Some(detail);
                }
            });
            default_hook(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|trace| trace.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
}

/// The error followed by its `source()` chain, one cause per line.
fn error_trace(err: &dyn std::error::Error) -> String {
    let mut trace = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(&mut trace, "\ncaused by: {cause}");
        source = cause.source();
    }
    trace
}

fn job_error(e: &JobError, now: chrono::DateTime<Utc>) -> LastError {
    LastError::new(format!("{}: {}", e.kind(), e), now)
        .with_traceback(format!("{}: {}", e.kind(), error_trace(e)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Loads job `id`, executes it and records the outcome.
///
/// Job errors and panics become outcomes; only store failures are returned
/// as errors.
pub fn run_job(store: &QueueStore, registry: &JobRegistry, id: JobId) -> Result<JobState> {
    let doc = store
        .load(id)?
        .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
    if doc.state() != JobState::Running {
        return Err(QueueError::conflict(format!(
            "job [{}] is [{}], expected running",
            id,
            doc.state()
        )));
    }
    tracing::info!(job_id = %id, name = doc.name(), trial = doc.trial(), "Executing job");

    let mut job = match registry.instantiate(doc.name()) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Cannot construct job");
            let now = Utc::now();
            store.set_error(id, job_error(&e, now), now)?;
            return Ok(JobState::Error);
        }
    };

    install_panic_capture();
    take_panic_trace();
    let mut ctx = JobContext::new(store, id, doc.progress_interval());
    let result = catch_unwind(AssertUnwindSafe(|| job.execute(&mut ctx, doc.args())));

    match result {
        Ok(Ok(())) => {
            ctx.force_progress(1.0, "finished")?;
            store.set_complete(id, Utc::now())?;
            Ok(JobState::Complete)
        }
        Ok(Err(JobError::Deferred(message))) => store.set_deferred(id, &message, Utc::now()),
        Ok(Err(e)) => {
            tracing::error!(job_id = %id, error = %e, "Job failed");
            let now = Utc::now();
            store.set_failed(id, job_error(&e, now), now)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(job_id = %id, panic = %message, "Job panicked");
            let now = Utc::now();
            let trace = take_panic_trace().unwrap_or_else(|| format!("panicked: {}", message));
            let error = LastError::new(format!("JobPanicked: {}", message), now).with_traceback(trace);
            store.set_failed(id, error, now)
        }
    }
}
