//! Fleet-wide periodic jobs, one runner at a time
//!
//! Every instance registers the same jobs. On each tick an instance tries the
//! job's [`DistLock`](crate::lock::DistLock); the one that gets it runs the
//! job and releases the lock, the others skip that tick. While a job runs its
//! lock is extended at half the lock TTL so long jobs are not taken over. A
//! job whose lock cannot be extended is cancelled, since another instance may
//! already be running it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::{Signal, internal};
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};

use crate::{error::Result, lock::LockService};

/// Floor for tick and heartbeat periods
const MIN_PERIOD: Duration = Duration::from_millis(10);

const fn default_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Default interval between runs of a job
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Work that must run on at most one instance at a time.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable name, also the lock resource (`job:<name>`).
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ran,
    Failed,
    /// Another instance holds the job's lock
    Skipped,
    /// The lock could not be extended, the run was cancelled
    LockLost,
}

#[derive(Clone)]
struct Registered {
    job: Arc<dyn Job>,
    interval: Duration,
}

pub struct ExclusiveScheduler {
    locks: LockService,
    jobs: Vec<Registered>,
}

impl std::fmt::Debug for ExclusiveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveScheduler")
            .field("locks", &self.locks)
            .field(
                "jobs",
                &self.jobs.iter().map(|r| r.job.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ExclusiveScheduler {
    #[must_use]
    pub const fn new(locks: LockService) -> Self {
        Self {
            locks,
            jobs: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>, interval: Duration) {
        let interval = interval.max(MIN_PERIOD);
        internal!(level = DEBUG, "Registered job {} every {interval:?}", job.name());
        self.jobs.push(Registered { job, interval });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run `job` once if this instance can take its lock.
    pub async fn run_once(&self, job: &dyn Job) -> JobOutcome {
        run_exclusive(&self.locks, job).await
    }

    /// Run every registered job on its interval until a shutdown signal.
    ///
    /// The first run of each job happens one interval after start.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) {
        internal!("Scheduler starting with {} jobs", self.jobs.len());

        let mut tasks = JoinSet::new();
        for registered in self.jobs.iter().cloned() {
            let locks = self.locks.clone();
            let mut shutdown = shutdown.resubscribe();

            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(registered.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_exclusive(&locks, registered.job.as_ref()).await;
                        }
                        sig = shutdown.recv() => {
                            match sig {
                                Ok(Signal::Shutdown | Signal::Finalised) => break,
                                Err(broadcast::error::RecvError::Lagged(_)) => {}
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Scheduler task ended abnormally");
            }
        }

        internal!("Scheduler shutdown complete");
    }
}

async fn run_exclusive(locks: &LockService, job: &dyn Job) -> JobOutcome {
    let lock = locks.lock(&format!("job:{}", job.name()));
    if !lock.acquire().await {
        tracing::debug!(job = job.name(), "Job held elsewhere, skipping");
        return JobOutcome::Skipped;
    }

    let ttl = locks.ttl();
    let mut heartbeat = tokio::time::interval((ttl / 2).max(MIN_PERIOD));
    heartbeat.tick().await;

    let run = job.run();
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = heartbeat.tick() => {
                if !lock.extend(ttl).await {
                    tracing::warn!(job = job.name(), "Lost job lock while running, cancelling");
                    return JobOutcome::LockLost;
                }
            }
        }
    };

    lock.release().await;

    match result {
        Ok(()) => {
            tracing::debug!(job = job.name(), "Job finished");
            JobOutcome::Ran
        }
        Err(err) => {
            tracing::error!(job = job.name(), error = %err, "Job failed");
            JobOutcome::Failed
        }
    }
}
