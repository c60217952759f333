use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::job::{JobDocument, JobId};
use crate::store::QueueStore;

/// Starts and supervises isolated job processes.
pub trait JobLauncher {
    /// Spawns a process for `doc` and returns its pid.
    fn launch(&mut self, doc: &JobDocument) -> Result<u32>;

    /// Whether the process started for `id` is still running. Unknown ids
    /// are not alive.
    fn is_alive(&mut self, id: JobId) -> bool;

    /// Asks the process for `id` to stop. Returns `false` for unknown ids.
    fn terminate(&mut self, id: JobId) -> bool;

    /// Forgets processes that have exited and returns their job ids.
    fn reap(&mut self) -> Vec<JobId>;
}

struct RunningProcess {
    pid: u32,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Launches each job as a child process that receives the job id on stdin.
///
/// stdout and stderr are captured and saved in the store when the process
/// exits.
pub struct ProcessLauncher {
    store: Arc<QueueStore>,
    program: PathBuf,
    args: Vec<String>,
    running: HashMap<JobId, RunningProcess>,
}

impl ProcessLauncher {
    pub fn new(store: Arc<QueueStore>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            store,
            program: program.into(),
            args,
            running: HashMap::new(),
        }
    }

    pub fn pid(&self, id: JobId) -> Option<u32> {
        self.running.get(&id).map(|p| p.pid)
    }

    pub fn running_count(&self) -> usize {
        self.running
            .values()
            .filter(|p| !p.handle.is_finished())
            .count()
    }
}

impl JobLauncher for ProcessLauncher {
    fn launch(&mut self, doc: &JobDocument) -> Result<u32> {
        let job_id = doc.id();
        tracing::info!(job_id = %job_id, name = doc.name(), program = %self.program.display(), "Launching job process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| QueueError::Io(std::io::Error::other("child exited before reporting a pid")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                let line = format!("{}\n", job_id);
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to hand job id to process");
                }
                // dropping closes stdin
            }

            let stdout_task = tokio::spawn(read_all(stdout));
            let stderr_task = tokio::spawn(read_all(stderr));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    tracing::warn!(job_id = %job_id, pid, "Killing job process");
                    if let Err(e) = child.kill().await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to kill job process");
                    }
                    child.wait().await
                }
            };

            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();

            match status {
                Ok(status) => {
                    tracing::info!(job_id = %job_id, exit_code = ?status.code(), "Job process exited");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Job process wait failed");
                }
            }

            let saved = tokio::task::spawn_blocking(move || {
                store.save_output(job_id, &out, &err, Utc::now())
            })
            .await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(job_id = %job_id, error = %e, "Failed to save job output"),
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Output task failed"),
            }
        });

        self.running.insert(
            job_id,
            RunningProcess {
                pid,
                cancel,
                handle,
            },
        );
        Ok(pid)
    }

    fn is_alive(&mut self, id: JobId) -> bool {
        self.running
            .get(&id)
            .map(|p| !p.handle.is_finished())
            .unwrap_or(false)
    }

    fn terminate(&mut self, id: JobId) -> bool {
        match self.running.get(&id) {
            Some(process) => {
                process.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn reap(&mut self) -> Vec<JobId> {
        let finished: Vec<JobId> = self
            .running
            .iter()
            .filter(|(_, p)| p.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            self.running.remove(id);
        }
        finished
    }
}

async fn read_all<R: AsyncReadExt + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            tracing::warn!(error = %e, "Failed to read job process output");
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}
