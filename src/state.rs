use crate::monitor::{DaemonState, TickReport};
use crate::scheduler::JobStatus;

/// Latest view of the daemon, shared between the monitor loop and the HTTP
/// handlers.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub monitor: DaemonState,
    pub ticks: u64,
    pub tick_failures: u64,
    pub last_tick_unix: Option<i64>,
    pub last_tick_error: Option<String>,
    pub last_report: Option<TickReport>,
    pub jobs: Vec<JobStatus>,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn record_tick(&mut self, report: TickReport, jobs: Vec<JobStatus>) {
        self.ticks += 1;
        self.last_tick_unix = Some(report.finished_at_unix);
        self.last_report = Some(report);
        self.jobs = jobs;
    }

    /// Keeps the previous report; a failed tick has nothing newer to show.
    pub fn record_tick_failure(&mut self, now_unix: i64, error: String) {
        self.tick_failures += 1;
        self.last_tick_unix = Some(now_unix);
        self.last_tick_error = Some(error);
    }
}
