//! Periodic task runner
//!
//! Each task ticks on its own interval. Blocking jobs run on the blocking pool
//! (they hold the SQLite connection); async jobs that call out to the store
//! platform are awaited on the task itself. A task never overlaps with itself:
//! ticks missed while a run is still going are skipped. Job errors are logged
//! and the task keeps its schedule.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::Result;

pub struct TaskRunner {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Start `job` now and then every `period`
    pub fn spawn<F>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let mut stop = self.shutdown.subscribe();

        info!(task = name, period_secs = period.as_secs(), "Starting periodic task");

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.changed() => break,
                }

                let job = Arc::clone(&job);
                match tokio::task::spawn_blocking(move || job()).await {
                    Ok(Ok(())) => debug!(task = name, "Periodic task run complete"),
                    Ok(Err(e)) => error!(task = name, error = %e, "Periodic task run failed"),
                    Err(e) => error!(task = name, error = %e, "Periodic task aborted"),
                }
            }

            info!(task = name, "Periodic task stopped");
        });

        self.handles.push((name, handle));
    }

    /// Like [`spawn`](Self::spawn), for jobs that await network calls
    pub fn spawn_async<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();

        info!(task = name, period_secs = period.as_secs(), "Starting periodic task");

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.changed() => break,
                }

                match job().await {
                    Ok(()) => debug!(task = name, "Periodic task run complete"),
                    Err(e) => error!(task = name, error = %e, "Periodic task run failed"),
                }
            }

            info!(task = name, "Periodic task stopped");
        });

        self.handles.push((name, handle));
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Signal every task and wait for in-flight runs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Periodic task did not shut down cleanly");
            }
        }
    }
}
