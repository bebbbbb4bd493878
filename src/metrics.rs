use crate::monitor::TickReport;
use crate::scheduler::JobOutcome;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub osaid_cpu_percent: Gauge,
    pub osaid_memory_percent: Gauge,
    pub osaid_swap_percent: Gauge,
    pub osaid_disk_percent: Gauge,
    pub osaid_battery_percent: Gauge,
    pub osaid_process_count: Gauge,
    pub osaid_net_tx_bytes_total: Gauge,
    pub osaid_net_rx_bytes_total: Gauge,
    pub osaid_net_tx_bytes_per_tick: Gauge,
    pub osaid_net_rx_bytes_per_tick: Gauge,
    pub osaid_listening_sockets: Gauge,
    pub osaid_ticks_total: Counter,
    pub osaid_tick_failures_total: Counter,
    pub osaid_job_runs_total: CounterVec,
    pub osaid_advisories_total: CounterVec,
    pub osaid_scrape_count_total: Counter,
    pub osaid_last_tick_timestamp_seconds: Gauge,
    pub osaid_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let osaid_cpu_percent = Gauge::with_opts(opts!(
            "osaid_cpu_percent",
            "Average CPU usage across cores in percent (0..100); NaN when unavailable"
        ))?;
        let osaid_memory_percent = Gauge::with_opts(opts!(
            "osaid_memory_percent",
            "Virtual memory usage in percent"
        ))?;
        let osaid_swap_percent =
            Gauge::with_opts(opts!("osaid_swap_percent", "Swap usage in percent"))?;
        let osaid_disk_percent = Gauge::with_opts(opts!(
            "osaid_disk_percent",
            "Usage of the monitored filesystem in percent"
        ))?;
        let osaid_battery_percent = Gauge::with_opts(opts!(
            "osaid_battery_percent",
            "Battery charge in percent; NaN without a battery"
        ))?;
        let osaid_process_count =
            Gauge::with_opts(opts!("osaid_process_count", "Number of processes"))?;
        let osaid_net_tx_bytes_total = Gauge::with_opts(opts!(
            "osaid_net_tx_bytes_total",
            "Cumulative bytes sent over all interfaces"
        ))?;
        let osaid_net_rx_bytes_total = Gauge::with_opts(opts!(
            "osaid_net_rx_bytes_total",
            "Cumulative bytes received over all interfaces"
        ))?;
        let osaid_net_tx_bytes_per_tick = Gauge::with_opts(opts!(
            "osaid_net_tx_bytes_per_tick",
            "Bytes sent since the previous tick"
        ))?;
        let osaid_net_rx_bytes_per_tick = Gauge::with_opts(opts!(
            "osaid_net_rx_bytes_per_tick",
            "Bytes received since the previous tick"
        ))?;
        let osaid_listening_sockets = Gauge::with_opts(opts!(
            "osaid_listening_sockets",
            "Listening internet sockets seen on the last tick"
        ))?;
        let osaid_ticks_total =
            Counter::with_opts(opts!("osaid_ticks_total", "Completed monitor ticks"))?;
        let osaid_tick_failures_total = Counter::with_opts(opts!(
            "osaid_tick_failures_total",
            "Monitor ticks aborted by an unexpected failure"
        ))?;
        let osaid_job_runs_total = CounterVec::new(
            opts!(
                "osaid_job_runs_total",
                "Scheduled job executions by job and outcome"
            ),
            &["job", "outcome"],
        )?;
        let osaid_advisories_total = CounterVec::new(
            opts!(
                "osaid_advisories_total",
                "Advisory records emitted by severity"
            ),
            &["severity"],
        )?;
        let osaid_scrape_count_total = Counter::with_opts(opts!(
            "osaid_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let osaid_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "osaid_last_tick_timestamp_seconds",
            "Unix timestamp of the last completed tick"
        ))?;
        let osaid_uptime_seconds =
            Gauge::with_opts(opts!("osaid_uptime_seconds", "Daemon uptime in seconds"))?;

        register(&registry, &osaid_cpu_percent)?;
        register(&registry, &osaid_memory_percent)?;
        register(&registry, &osaid_swap_percent)?;
        register(&registry, &osaid_disk_percent)?;
        register(&registry, &osaid_battery_percent)?;
        register(&registry, &osaid_process_count)?;
        register(&registry, &osaid_net_tx_bytes_total)?;
        register(&registry, &osaid_net_rx_bytes_total)?;
        register(&registry, &osaid_net_tx_bytes_per_tick)?;
        register(&registry, &osaid_net_rx_bytes_per_tick)?;
        register(&registry, &osaid_listening_sockets)?;
        register(&registry, &osaid_ticks_total)?;
        register(&registry, &osaid_tick_failures_total)?;
        register(&registry, &osaid_job_runs_total)?;
        register(&registry, &osaid_advisories_total)?;
        register(&registry, &osaid_scrape_count_total)?;
        register(&registry, &osaid_last_tick_timestamp_seconds)?;
        register(&registry, &osaid_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            osaid_cpu_percent,
            osaid_memory_percent,
            osaid_swap_percent,
            osaid_disk_percent,
            osaid_battery_percent,
            osaid_process_count,
            osaid_net_tx_bytes_total,
            osaid_net_rx_bytes_total,
            osaid_net_tx_bytes_per_tick,
            osaid_net_rx_bytes_per_tick,
            osaid_listening_sockets,
            osaid_ticks_total,
            osaid_tick_failures_total,
            osaid_job_runs_total,
            osaid_advisories_total,
            osaid_scrape_count_total,
            osaid_last_tick_timestamp_seconds,
            osaid_uptime_seconds,
        }))
    }

    pub fn update_from_tick(&self, report: &TickReport) {
        let snap = &report.reading.snapshot;
        set_optional(&self.osaid_cpu_percent, snap.cpu_percent);
        set_optional(&self.osaid_memory_percent, snap.mem_percent);
        set_optional(&self.osaid_swap_percent, snap.swap_percent);
        set_optional(&self.osaid_disk_percent, snap.disk_percent);
        set_optional(&self.osaid_battery_percent, snap.battery_percent);
        set_optional(
            &self.osaid_process_count,
            snap.process_count.map(|c| c as f64),
        );
        set_optional(
            &self.osaid_net_tx_bytes_total,
            snap.net.map(|n| n.tx_bytes as f64),
        );
        set_optional(
            &self.osaid_net_rx_bytes_total,
            snap.net.map(|n| n.rx_bytes as f64),
        );
        set_optional(
            &self.osaid_net_tx_bytes_per_tick,
            report.reading.rate.map(|r| r.tx_bytes as f64),
        );
        set_optional(
            &self.osaid_net_rx_bytes_per_tick,
            report.reading.rate.map(|r| r.rx_bytes as f64),
        );
        set_optional(
            &self.osaid_listening_sockets,
            report.connections.as_ref().map(|c| c.listening as f64),
        );

        for advisory in &report.advisories {
            self.osaid_advisories_total
                .with_label_values(&[advisory.severity.as_str()])
                .inc();
        }
        for run in &report.job_runs {
            let outcome = match run.outcome {
                JobOutcome::Succeeded(_) => "success",
                JobOutcome::Failed(_) => "failure",
            };
            self.osaid_job_runs_total
                .with_label_values(&[&run.name, outcome])
                .inc();
        }

        self.osaid_ticks_total.inc();
        self.osaid_last_tick_timestamp_seconds
            .set(report.finished_at_unix as f64);
    }

    pub fn inc_tick_failure(&self) {
        self.osaid_tick_failures_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.osaid_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.osaid_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn set_optional(gauge: &Gauge, value: Option<f64>) {
    gauge.set(value.unwrap_or(f64::NAN));
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::sampler::Reading;
    use crate::collectors::Snapshot;
    use crate::heuristics::{Advisory, AdvisoryKind, Severity};
    use crate::scheduler::JobRun;

    #[test]
    fn tick_updates_gauges_and_counters() {
        let metrics = Metrics::new().expect("metrics init");
        let report = TickReport {
            reading: Reading {
                snapshot: Snapshot {
                    cpu_percent: Some(42.0),
                    ..Snapshot::default()
                },
                rate: None,
            },
            connections: None,
            advisories: vec![Advisory {
                severity: Severity::Warning,
                kind: AdvisoryKind::DiskUsage,
                message: "disk".to_string(),
            }],
            job_runs: vec![JobRun {
                name: "backup".to_string(),
                outcome: JobOutcome::Failed("nope".to_string()),
            }],
            finished_at_unix: 1_700_000_000,
        };

        metrics.update_from_tick(&report);

        assert_eq!(metrics.osaid_cpu_percent.get(), 42.0);
        assert!(metrics.osaid_battery_percent.get().is_nan());
        assert_eq!(metrics.osaid_ticks_total.get(), 1.0);
        assert_eq!(
            metrics
                .osaid_job_runs_total
                .with_label_values(&["backup", "failure"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .osaid_advisories_total
                .with_label_values(&["warning"])
                .get(),
            1.0
        );

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("osaid_uptime_seconds"));
        assert!(text.contains("osaid_last_tick_timestamp_seconds"));
    }
}
