use crate::collectors::{
    clamp_percent, NetCounters, NetRate, ProbeError, Snapshot, SystemProvider,
};
use crate::heuristics::{build_connection_report, ConnectionReport};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub snapshot: Snapshot,
    /// Absent on the first reading of a sampler and whenever the network
    /// counters could not be read.
    pub rate: Option<NetRate>,
}

/// Pulls snapshots out of a provider and tracks the previous network
/// counters for rate computation.
///
/// A sampler is single-owner: whoever needs readings concurrently must build
/// their own instance instead of sharing one.
pub struct Sampler {
    provider: Box<dyn SystemProvider>,
    disk_path: PathBuf,
    prev_net: Option<NetCounters>,
}

impl Sampler {
    pub fn new(provider: Box<dyn SystemProvider>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            disk_path: disk_path.into(),
            prev_net: None,
        }
    }

    pub fn sample(&mut self) -> Reading {
        let provider = self.provider.as_mut();
        let cpu_percent = probe("cpu", provider.cpu_percent());
        let mem_percent = probe("memory", provider.memory_percent());
        let swap_percent = probe("swap", provider.swap_percent());
        let disk_percent = probe("disk", provider.disk_percent(&self.disk_path));
        let battery_percent = probe("battery", provider.battery_percent()).flatten();
        let process_count = probe("pids", provider.pids()).map(|pids| pids.len() as u64);
        let net = probe("net", provider.net_io_counters());

        // A failed read breaks the series; the next rate needs two
        // consecutive good reads.
        let rate = match net {
            Some(current) => self.advance_net(current),
            None => {
                self.prev_net = None;
                None
            }
        };

        Reading {
            snapshot: Snapshot {
                cpu_percent: cpu_percent.and_then(clamp_percent),
                mem_percent: mem_percent.and_then(clamp_percent),
                swap_percent: swap_percent.and_then(clamp_percent),
                disk_percent: disk_percent.and_then(clamp_percent),
                battery_percent: battery_percent.and_then(clamp_percent),
                process_count,
                net,
            },
            rate,
        }
    }

    /// Enumerates sockets and aggregates them for the security and privacy
    /// heuristics. Process names are resolved through the same provider.
    pub fn connection_report(&mut self) -> Result<ConnectionReport, ProbeError> {
        let provider = self.provider.as_mut();
        let connections = provider.net_connections()?;
        Ok(build_connection_report(&connections, |pid| {
            provider.process_name(pid).ok()
        }))
    }

    pub fn provider_mut(&mut self) -> &mut dyn SystemProvider {
        self.provider.as_mut()
    }

    fn advance_net(&mut self, current: NetCounters) -> Option<NetRate> {
        let previous = self.prev_net.replace(current)?;
        let rate = NetRate {
            tx_bytes: current.tx_bytes as i64 - previous.tx_bytes as i64,
            rx_bytes: current.rx_bytes as i64 - previous.rx_bytes as i64,
        };
        if rate.tx_bytes < 0 || rate.rx_bytes < 0 {
            // Interface reset or counter wraparound; reported as-is.
            warn!(
                tx_delta = rate.tx_bytes,
                rx_delta = rate.rx_bytes,
                "network counters went backwards"
            );
        }
        Some(rate)
    }
}

fn probe<T>(metric: &'static str, result: Result<T, ProbeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(metric, error = %err, "metric unavailable");
            None
        }
    }
}
