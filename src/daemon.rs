//! Lifecycle shared by the worker and scheduler daemons.
//!
//! A daemon moves through `startup → loop → shutdown → exit`. Each phase is
//! timestamped in the store. The loop runs the daemon's steps at their own
//! cadence, heartbeats on every tick, idles while maintenance is active and
//! ends on a halt request issued after startup or on process shutdown.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::node::NodeInfo;
use crate::store::{DaemonPhase, QueueStore};

/// Steps and hooks of a concrete daemon.
pub trait Daemon {
    fn kind(&self) -> &'static str;

    fn identity(&self) -> &str;

    /// Step names with their intervals.
    fn plan(&self) -> Vec<(&'static str, Duration)>;

    fn startup(&mut self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn run_step(&mut self, step: &str, now: DateTime<Utc>) -> Result<()>;

    fn shutdown(&mut self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Names of the steps that were due and ran
    Ran(Vec<&'static str>),
    Maintenance,
    Halted,
}

struct StepSchedule {
    name: &'static str,
    interval: Duration,
    last_run: Option<DateTime<Utc>>,
}

impl StepSchedule {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.interval)
                .unwrap_or(false),
        }
    }
}

pub struct DaemonRunner<D: Daemon> {
    daemon: D,
    store: Arc<QueueStore>,
    node: NodeInfo,
    alive_timeout: Duration,
    steps: Vec<StepSchedule>,
    started_at: Option<DateTime<Utc>>,
}

impl<D: Daemon> DaemonRunner<D> {
    pub fn new(daemon: D, store: Arc<QueueStore>, alive_timeout: Duration) -> Self {
        let steps = daemon
            .plan()
            .into_iter()
            .map(|(name, interval)| StepSchedule {
                name,
                interval,
                last_run: None,
            })
            .collect();
        Self {
            daemon,
            store,
            node: NodeInfo::current(),
            alive_timeout,
            steps,
            started_at: None,
        }
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut D {
        &mut self.daemon
    }

    /// Loop tick: the shortest step interval.
    pub fn tick_interval(&self) -> Duration {
        self.steps
            .iter()
            .map(|s| s.interval)
            .min()
            .unwrap_or(Duration::from_secs(1))
    }

    /// Registers the daemon, runs its startup hook and enters the loop phase.
    pub fn startup(&mut self, now: DateTime<Utc>) -> Result<()> {
        let kind = self.daemon.kind();
        let identity = self.daemon.identity().to_string();
        self.store.register_daemon(
            kind,
            &identity,
            &self.node.hostname,
            self.node.pid,
            now,
            self.alive_timeout,
        )?;
        self.started_at = Some(now);
        tracing::info!(kind, identity = %identity, pid = self.node.pid, "Daemon starting");
        self.daemon.startup(now)?;
        self.store
            .enter_phase(kind, &identity, DaemonPhase::Loop, now)?;
        Ok(())
    }

    /// One loop iteration at `now`.
    ///
    /// Step failures are logged and do not stop the remaining steps.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let kind = self.daemon.kind();
        let identity = self.daemon.identity().to_string();
        self.store.daemon_heartbeat(kind, &identity, now)?;

        let started_at = self.started_at.unwrap_or(now);
        if self.store.halt_requested_since(started_at)? {
            tracing::info!(kind, identity = %identity, "Halt requested");
            return Ok(TickOutcome::Halted);
        }
        if self.store.in_maintenance()? {
            tracing::debug!(kind, identity = %identity, "Maintenance, skipping steps");
            return Ok(TickOutcome::Maintenance);
        }

        let mut ran = Vec::new();
        for i in 0..self.steps.len() {
            if !self.steps[i].is_due(now) {
                continue;
            }
            let name = self.steps[i].name;
            self.steps[i].last_run = Some(now);
            if let Err(e) = self.daemon.run_step(name, now) {
                tracing::error!(kind, identity = %identity, step = name, error = %e, "Step failed");
            }
            ran.push(name);
        }
        Ok(TickOutcome::Ran(ran))
    }

    /// Runs the shutdown hook and records the shutdown and exit phases.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<()> {
        let kind = self.daemon.kind();
        let identity = self.daemon.identity().to_string();
        let phase = self
            .store
            .enter_phase(kind, &identity, DaemonPhase::Shutdown, now);
        let hook = self.daemon.shutdown(now);
        let exit = self
            .store
            .enter_phase(kind, &identity, DaemonPhase::Exit, now);
        tracing::info!(kind, identity = %identity, "Daemon exited");
        phase.and(hook).and(exit)
    }
}

impl<D: Daemon + Send + 'static> DaemonRunner<D> {
    /// Runs the full lifecycle until halted or `shutdown` is cancelled.
    ///
    /// Every phase and tick runs on the blocking pool since store calls may
    /// wait up to the busy timeout for the database lock.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (runner, started) = self.blocking(|r| r.startup(Utc::now())).await?;
        if let Err(e) = started {
            // registered but the startup hook failed: still record the exit
            if runner.started_at.is_some() {
                let (_, finished) = runner.blocking(|r| r.finish(Utc::now())).await?;
                if let Err(finish) = finished {
                    tracing::error!(error = %finish, "Daemon shutdown failed");
                }
            }
            return Err(e);
        }
        let tick = runner.tick_interval();
        let runner = runner.run_loop(&shutdown, tick).await?;
        let (_, finished) = runner.blocking(|r| r.finish(Utc::now())).await?;
        finished
    }

    async fn run_loop(mut self, shutdown: &CancellationToken, tick: Duration) -> Result<Self> {
        loop {
            let (runner, outcome) = self.blocking(|r| r.tick(Utc::now())).await?;
            self = runner;
            match outcome {
                Ok(TickOutcome::Halted) => return Ok(self),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Daemon tick failed");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, leaving loop");
                    return Ok(self);
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Moves the runner onto the blocking pool for `f` and hands it back.
    async fn blocking<T, F>(mut self, f: F) -> Result<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce(&mut Self) -> T + Send + 'static,
    {
        Ok(tokio::task::spawn_blocking(move || {
            let out = f(&mut self);
            (self, out)
        })
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    struct Counter {
        runs: Vec<&'static str>,
        fail: bool,
    }

    impl Daemon for Counter {
        fn kind(&self) -> &'static str {
            "counter"
        }

        fn identity(&self) -> &str {
            "c1"
        }

        fn plan(&self) -> Vec<(&'static str, Duration)> {
            vec![
                ("fast", Duration::from_secs(1)),
                ("slow", Duration::from_secs(5)),
            ]
        }

        fn run_step(&mut self, step: &str, _now: DateTime<Utc>) -> Result<()> {
            self.runs.push(if step == "fast" { "fast" } else { "slow" });
            if self.fail {
                return Err(crate::error::QueueError::conflict("boom"));
            }
            Ok(())
        }
    }

    fn runner(fail: bool) -> DaemonRunner<Counter> {
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        DaemonRunner::new(
            Counter {
                runs: Vec::new(),
                fail,
            },
            store,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn steps_run_at_their_cadence() {
        let mut r = runner(false);
        let t0 = Utc::now();
        r.startup(t0).unwrap();
        assert_eq!(r.tick_interval(), Duration::from_secs(1));
        assert_eq!(r.tick(t0).unwrap(), TickOutcome::Ran(vec!["fast", "slow"]));
        assert_eq!(
            r.tick(t0 + ChronoDuration::seconds(1)).unwrap(),
            TickOutcome::Ran(vec!["fast"])
        );
        assert_eq!(
            r.tick(t0 + ChronoDuration::seconds(5)).unwrap(),
            TickOutcome::Ran(vec!["fast", "slow"])
        );
    }

    #[test]
    fn failing_step_does_not_stop_the_tick() {
        let mut r = runner(true);
        let t0 = Utc::now();
        r.startup(t0).unwrap();
        assert_eq!(r.tick(t0).unwrap(), TickOutcome::Ran(vec!["fast", "slow"]));
        assert_eq!(r.daemon().runs.len(), 2);
    }

    #[test]
    fn finish_records_exit() {
        let mut r = runner(false);
        let t0 = Utc::now();
        r.startup(t0).unwrap();
        r.finish(t0).unwrap();
        let record = r.store.daemon("counter", "c1").unwrap().unwrap();
        assert!(record.loop_at.is_some());
        assert!(record.shutdown_at.is_some());
        assert!(record.exit_at.is_some());
    }
}
