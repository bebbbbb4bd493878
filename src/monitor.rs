//! Monitor loop and its start/stop controller.
//!
//! One background task owns the sampler and the job scheduler. Each tick runs
//! sample -> evaluate -> poll jobs on the blocking pool, strictly in that order
//! and never overlapping with the next tick. Stopping is cooperative: the
//! signal is observed between ticks, so a stop can lag by at most one tick
//! (including any slow provider call or job inside it).

use crate::collectors::sampler::{Reading, Sampler};
use crate::collectors::{ProviderFactory, SystemProvider};
use crate::config::MonitorConfig;
use crate::heuristics::{evaluate, log_advisories, Advisory, ConnectionReport};
use crate::jobs::build_scheduler;
use crate::metrics::{now_unix, Metrics};
use crate::scheduler::{panic_message, JobRun, JobStatus, Scheduler};
use crate::state::State;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub reading: Reading,
    pub connections: Option<ConnectionReport>,
    pub advisories: Vec<Advisory>,
    pub job_runs: Vec<JobRun>,
    pub finished_at_unix: i64,
}

/// Everything the loop owns across ticks.
struct Worker {
    sampler: Sampler,
    scheduler: Option<Scheduler>,
}

impl Worker {
    fn tick(&mut self, now: Instant) -> TickReport {
        let reading = self.sampler.sample();
        log_reading(&reading);

        let connections = match self.sampler.connection_report() {
            Ok(report) => Some(report),
            Err(err) => {
                debug!(error = %err, "socket enumeration failed, skipping socket heuristics");
                None
            }
        };
        let advisories = evaluate(&reading.snapshot, connections.as_ref());
        log_advisories(&advisories);

        let job_runs = match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.poll(now),
            None => Vec::new(),
        };

        TickReport {
            reading,
            connections,
            advisories,
            job_runs,
            finished_at_unix: now_unix(),
        }
    }

    fn job_status(&self) -> Vec<JobStatus> {
        self.scheduler
            .as_ref()
            .map(Scheduler::status)
            .unwrap_or_default()
    }
}

/// Runs a single tick with a fresh sampler and no automation jobs.
pub fn single_tick(cfg: &MonitorConfig, provider: Box<dyn SystemProvider>) -> TickReport {
    let mut worker = Worker {
        sampler: Sampler::new(provider, cfg.resolved_disk_path()),
        scheduler: None,
    };
    worker.tick(Instant::now())
}

pub struct Monitor {
    cfg: MonitorConfig,
    interval: Duration,
    stop_timeout: Duration,
    providers: ProviderFactory,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
    /// A stopped loop that outlived the stop timeout.
    draining: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(
        cfg: MonitorConfig,
        providers: ProviderFactory,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<State>>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            stop_timeout: Duration::from_secs(cfg.stop_timeout_secs),
            cfg,
            providers,
            metrics,
            state,
            task: None,
            shutdown: None,
            draining: None,
        }
    }

    /// Overrides the tick interval and stop timeout taken from config.
    pub fn with_timing(mut self, interval: Duration, stop_timeout: Duration) -> Self {
        self.interval = interval;
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn state(&self) -> DaemonState {
        if self.loop_alive() {
            DaemonState::Running
        } else {
            DaemonState::Stopped
        }
    }

    /// A loop counts as alive while its task has not finished and it has not
    /// been told to stop. A task that died on its own is not alive.
    fn loop_alive(&self) -> bool {
        let task_running = self.task.as_ref().is_some_and(|t| !t.is_finished());
        let stopping = self.shutdown.as_ref().map_or(true, |tx| *tx.borrow());
        task_running && !stopping
    }

    /// Spawns the monitor loop. Returns `false` when a loop is already
    /// running. If a previously stopped loop is still finishing a tick, the
    /// new loop waits for it to exit before its first tick. Must be called
    /// from within a Tokio runtime.
    pub fn start(&mut self) -> bool {
        if self.loop_alive() {
            debug!("monitor already running, start ignored");
            return false;
        }

        let scheduler = if self.cfg.automation_enabled {
            match build_scheduler(&self.cfg) {
                Ok(scheduler) => Some(scheduler),
                Err(err) => {
                    error!(error = %err, "failed to register automation jobs, continuing without them");
                    None
                }
            }
        } else {
            None
        };

        let worker = Worker {
            sampler: Sampler::new((self.providers)(), self.cfg.resolved_disk_path()),
            scheduler,
        };

        let previous = self.draining.take().filter(|t| !t.is_finished());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("monitor");
        let task = tokio::spawn(
            run_loop(
                previous,
                worker,
                self.interval,
                shutdown_rx,
                self.metrics.clone(),
                self.state.clone(),
            )
            .instrument(span),
        );

        self.task = Some(task);
        self.shutdown = Some(shutdown_tx);

        info!(
            interval = %humantime::format_duration(self.interval),
            automation = self.cfg.automation_enabled,
            "monitor started"
        );
        true
    }

    /// Signals the loop and waits up to the stop timeout for it to exit.
    /// Returns whether the loop was observed to exit in time. Calling this
    /// while stopped is a no-op.
    pub async fn stop(&mut self) -> bool {
        let Some(shutdown) = self.shutdown.take() else {
            debug!("monitor not running, stop ignored");
            return true;
        };
        let _ = shutdown.send(true);

        let Some(mut task) = self.task.take() else {
            return true;
        };

        let waited = tokio::time::timeout(self.stop_timeout, &mut task).await;
        let joined = match waited {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(error = %err, "monitor task ended abnormally");
                true
            }
            Err(_elapsed) => {
                warn!(
                    timeout = %humantime::format_duration(self.stop_timeout),
                    "monitor loop still busy after stop timeout; it will exit after the current tick"
                );
                self.draining = Some(task);
                false
            }
        };

        self.state.write().await.monitor = DaemonState::Stopped;
        info!("monitor stopped");
        joined
    }
}

/// Writes `Running` into the shared state. `Stopped` is written by
/// `Monitor::stop`, and here only when the loop dies on its own.
async fn run_loop(
    previous: Option<JoinHandle<()>>,
    mut worker: Worker,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
) {
    state.write().await.monitor = DaemonState::Running;

    // Awaited even when stopped meanwhile; loops never tick concurrently.
    if let Some(previous) = previous {
        debug!("waiting for the previous monitor loop to exit");
        let _ = previous.await;
        if !*shutdown.borrow() {
            state.write().await.monitor = DaemonState::Running;
        }
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("stop signal received, monitor loop exiting");
                break;
            }
            _ = ticker.tick() => {
                let span = Span::current();
                let joined = tokio::task::spawn_blocking(move || {
                    let _entered = span.enter();
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        let report = worker.tick(Instant::now());
                        let jobs = worker.job_status();
                        (report, jobs)
                    }));
                    (worker, outcome)
                })
                .await;

                let (returned, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "monitor worker lost, loop exiting");
                        state.write().await.monitor = DaemonState::Stopped;
                        break;
                    }
                };
                worker = returned;

                match outcome {
                    Ok((report, jobs)) => {
                        metrics.update_from_tick(&report);
                        state.write().await.record_tick(report, jobs);
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(error = %message, "monitor tick failed, continuing with next tick");
                        metrics.inc_tick_failure();
                        state.write().await.record_tick_failure(now_unix(), message);
                    }
                }
            }
        }
    }
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
}

fn log_reading(reading: &Reading) {
    let snap = &reading.snapshot;
    let procs = snap
        .process_count
        .map_or_else(|| "n/a".to_string(), |c| c.to_string());
    let net = match (snap.net, reading.rate) {
        (Some(n), Some(r)) => format!(
            "tx={} rx={} (+{}/+{})",
            n.tx_bytes, n.rx_bytes, r.tx_bytes, r.rx_bytes
        ),
        (Some(n), None) => format!("tx={} rx={}", n.tx_bytes, n.rx_bytes),
        (None, _) => "n/a".to_string(),
    };
    let battery = snap
        .battery_percent
        .map_or_else(|| "n/a".to_string(), |b| format!("{b:.0}%"));
    info!(
        "CPU {} | MEM {} | SWAP {} | DISK {} | PROC {} | NET {} | BAT {}",
        fmt_pct(snap.cpu_percent),
        fmt_pct(snap.mem_percent),
        fmt_pct(snap.swap_percent),
        fmt_pct(snap.disk_percent),
        procs,
        net,
        battery
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeProvider;
    use crate::heuristics::AdvisoryKind;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn quiet_cfg() -> MonitorConfig {
        MonitorConfig {
            automation_enabled: false,
            disk_path: Some(PathBuf::from("/")),
            ..MonitorConfig::default()
        }
    }

    fn factory(template: FakeProvider) -> ProviderFactory {
        Arc::new(move || Box::new(template.clone()) as Box<dyn SystemProvider>)
    }

    fn monitor(cfg: MonitorConfig, provider: FakeProvider) -> (Monitor, Arc<RwLock<State>>) {
        let metrics = Metrics::new().expect("metrics init");
        let state = Arc::new(RwLock::new(State::new(0)));
        let monitor = Monitor::new(cfg, factory(provider), metrics, state.clone())
            .with_timing(Duration::from_millis(100), Duration::from_secs(2));
        (monitor, state)
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let (mut monitor, _state) = monitor(quiet_cfg(), FakeProvider::healthy());
        let started = Instant::now();
        assert!(monitor.stop().await);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(monitor.state(), DaemonState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_start_runs_one_loop() {
        let provider = FakeProvider::healthy();
        let calls = provider.cpu_calls.clone();
        let (mut monitor, state) = monitor(quiet_cfg(), provider);

        assert!(monitor.start());
        assert!(!monitor.start(), "second start must be ignored");
        assert_eq!(monitor.state(), DaemonState::Running);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(monitor.stop().await);
        assert_eq!(monitor.state(), DaemonState::Stopped);

        // One loop at 100 ms ticks in 250 ms: ticks at 0, 100, 200.
        let seen = calls.load(Ordering::SeqCst);
        assert!((1..=4).contains(&seen), "cpu probed {seen} times");
        let guard = state.read().await;
        assert_eq!(guard.ticks, seen);
        assert_eq!(guard.monitor, DaemonState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_after_stop_spawns_new_loop() {
        let (mut monitor, _state) = monitor(quiet_cfg(), FakeProvider::healthy());
        assert!(monitor.start());
        assert!(monitor.stop().await);
        assert!(monitor.start(), "stopped monitor can start again");
        assert_eq!(monitor.state(), DaemonState::Running);
        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_tick_does_not_kill_loop() {
        let mut provider = FakeProvider::healthy();
        provider.panic_on_cpu = true;
        let (mut monitor, state) = monitor(quiet_cfg(), provider);

        monitor.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitor.state(), DaemonState::Running);
        monitor.stop().await;

        let guard = state.read().await;
        assert!(guard.tick_failures >= 2, "failures: {}", guard.tick_failures);
        assert_eq!(guard.ticks, 0);
        assert!(guard
            .last_tick_error
            .as_deref()
            .is_some_and(|e| e.contains("scripted provider panic")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_gives_up_after_timeout() {
        let mut provider = FakeProvider::healthy();
        provider.cpu_delay = Some(Duration::from_millis(800));
        let metrics = Metrics::new().unwrap();
        let state = Arc::new(RwLock::new(State::new(0)));
        let mut monitor = Monitor::new(quiet_cfg(), factory(provider), metrics, state)
            .with_timing(Duration::from_millis(50), Duration::from_millis(100));

        monitor.start();
        // Let the first tick get stuck in the slow provider call.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        let joined = monitor.stop().await;

        assert!(!joined);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(monitor.state(), DaemonState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_after_timed_out_stop_stays_running() {
        let mut provider = FakeProvider::healthy();
        provider.cpu_delay = Some(Duration::from_millis(400));
        let calls = provider.cpu_calls.clone();
        let metrics = Metrics::new().unwrap();
        let state = Arc::new(RwLock::new(State::new(0)));
        let mut monitor = Monitor::new(quiet_cfg(), factory(provider), metrics, state.clone())
            .with_timing(Duration::from_millis(50), Duration::from_millis(50));

        monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!monitor.stop().await, "first tick is still in the slow probe");
        assert!(monitor.start());

        // The old loop has finished its tick and exited by now.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(monitor.state(), DaemonState::Running);
        assert_eq!(state.read().await.monitor, DaemonState::Running);
        assert!(calls.load(Ordering::SeqCst) >= 2, "new loop never ticked");

        monitor.stop().await;
        assert_eq!(state.read().await.monitor, DaemonState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn automation_jobs_run_from_the_loop() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("stale.tmp"), b"x").unwrap();
        let cfg = MonitorConfig {
            automation_enabled: true,
            cleanup_dirs: vec![tmp.path().to_path_buf()],
            ..quiet_cfg()
        };
        let (mut monitor, state) = monitor(cfg, FakeProvider::healthy());

        monitor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop().await;

        assert!(!tmp.path().join("stale.tmp").exists());
        let guard = state.read().await;
        let names: Vec<&str> = guard.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["temp-cleanup", "backup"]);
        assert!(guard.jobs.iter().all(|j| j.runs == 1));
    }

    #[test]
    fn single_tick_evaluates_snapshot() {
        let mut provider = FakeProvider::healthy();
        provider.cpu = Some(90.0);
        provider.mem = Some(50.0);
        provider.disk = Some(50.0);
        let report = single_tick(&quiet_cfg(), Box::new(provider));

        assert_eq!(report.advisories.len(), 1);
        assert_eq!(report.advisories[0].kind, AdvisoryKind::HighCpu);
        assert!(report.job_runs.is_empty());
        assert_eq!(report.reading.rate, None);
    }
}
