//! Period-based job registry polled from the monitor loop.
//!
//! Jobs run synchronously on the caller's thread. A slow job therefore delays
//! the next sampling tick; there is no separate worker for automation.

use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// A unit of recurring maintenance work.
pub trait Job: Send {
    /// Runs once and returns a short human-readable summary.
    fn run(&mut self) -> Result<String, JobError>;
}

pub struct ScheduledJob {
    name: String,
    period: Duration,
    last_run: Option<Instant>,
    runs: u64,
    failures: u64,
    last_outcome: Option<JobOutcome>,
    action: Box<dyn Job>,
}

impl ScheduledJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub name: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub period_secs: u64,
    pub runs: u64,
    pub failures: u64,
    pub last_outcome: Option<JobOutcome>,
}

#[derive(Debug, Error)]
#[error("job '{0}' is already registered")]
pub struct DuplicateJob(pub String);

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        action: Box<dyn Job>,
    ) -> Result<(), DuplicateJob> {
        let name = name.into();
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(DuplicateJob(name));
        }
        self.jobs.push(ScheduledJob {
            name,
            period,
            last_run: None,
            runs: 0,
            failures: 0,
            last_outcome: None,
            action,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.iter()
    }

    /// Runs every job that is due at `now`, in registration order.
    ///
    /// `last_run` advances whether the job succeeded, failed or panicked, so a
    /// broken job retries at its normal period instead of every poll.
    pub fn poll(&mut self, now: Instant) -> Vec<JobRun> {
        let mut ran = Vec::new();
        for job in self.jobs.iter_mut() {
            if !job.is_due(now) {
                continue;
            }
            let outcome = match catch_unwind(AssertUnwindSafe(|| job.action.run())) {
                Ok(Ok(summary)) => {
                    info!(job = %job.name, "{summary}");
                    JobOutcome::Succeeded(summary)
                }
                Ok(Err(err)) => {
                    job.failures += 1;
                    warn!(job = %job.name, error = %err, "scheduled job failed");
                    JobOutcome::Failed(err.to_string())
                }
                Err(panic) => {
                    job.failures += 1;
                    let message = panic_message(panic.as_ref());
                    error!(job = %job.name, panic = %message, "scheduled job panicked");
                    JobOutcome::Failed(format!("panicked: {message}"))
                }
            };
            job.last_run = Some(now);
            job.runs += 1;
            job.last_outcome = Some(outcome.clone());
            ran.push(JobRun {
                name: job.name.clone(),
                outcome,
            });
        }
        ran
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|job| JobStatus {
                name: job.name.clone(),
                period_secs: job.period.as_secs(),
                runs: job.runs,
                failures: job.failures,
                last_outcome: job.last_outcome.clone(),
            })
            .collect()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
