pub mod sampler;
pub mod sockets;
pub mod system;

use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// One point-in-time reading of every tracked metric.
///
/// Fields the provider could not deliver are `None`; a missing reading is
/// never reported as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub swap_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub battery_percent: Option<f64>,
    pub process_count: Option<u64>,
    pub net: Option<NetCounters>,
}

/// Cumulative interface counters since boot, summed over all interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Byte deltas between two consecutive samples.
///
/// Signed on purpose: a counter reset shows up as a negative delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetRate {
    pub tx_bytes: i64,
    pub rx_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Listen,
    Established,
    Other,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub status: ConnStatus,
    pub pid: Option<u32>,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("{metric} unavailable: {reason}")]
    Unavailable { metric: &'static str, reason: String },
    #[error("process {0} no longer exists")]
    NoSuchProcess(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of raw operating-system readings.
///
/// Calls are synchronous and may block for tens of milliseconds. Every probe
/// is independent: one failing must not prevent the others from answering.
pub trait SystemProvider: Send {
    fn cpu_percent(&mut self) -> Result<f64, ProbeError>;
    fn memory_percent(&mut self) -> Result<f64, ProbeError>;
    fn swap_percent(&mut self) -> Result<f64, ProbeError>;
    fn disk_percent(&mut self, path: &Path) -> Result<f64, ProbeError>;
    /// `Ok(None)` means the host has no battery.
    fn battery_percent(&mut self) -> Result<Option<f64>, ProbeError>;
    fn pids(&mut self) -> Result<Vec<u32>, ProbeError>;
    fn net_io_counters(&mut self) -> Result<NetCounters, ProbeError>;
    /// Internet sockets (TCP and UDP, v4 and v6).
    fn net_connections(&mut self) -> Result<Vec<Connection>, ProbeError>;
    fn process_name(&mut self, pid: u32) -> Result<String, ProbeError>;
}

/// Builds a fresh provider; every consumer that samples gets its own.
pub type ProviderFactory = std::sync::Arc<dyn Fn() -> Box<dyn SystemProvider> + Send + Sync>;

pub fn clamp_percent(value: f64) -> Option<f64> {
    if value.is_nan() {
        return None;
    }
    Some(value.clamp(0.0, 100.0))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Scriptable provider for tests. `None` fields fail their probe.
    #[derive(Debug, Clone, Default)]
    pub struct FakeProvider {
        pub cpu: Option<f64>,
        pub mem: Option<f64>,
        pub swap: Option<f64>,
        pub disk: Option<f64>,
        pub battery: Option<Option<f64>>,
        pub pids: Option<Vec<u32>>,
        pub net: Option<NetCounters>,
        pub connections: Option<Vec<Connection>>,
        pub names: HashMap<u32, String>,
        pub cpu_calls: Arc<AtomicU64>,
        pub panic_on_cpu: bool,
        pub cpu_delay: Option<std::time::Duration>,
    }

    impl FakeProvider {
        pub fn healthy() -> Self {
            Self {
                cpu: Some(10.0),
                mem: Some(40.0),
                swap: Some(0.0),
                disk: Some(50.0),
                battery: Some(None),
                pids: Some(vec![1, 2, 3]),
                net: Some(NetCounters::default()),
                connections: Some(Vec::new()),
                ..Self::default()
            }
        }
    }

    fn unavailable(metric: &'static str) -> ProbeError {
        ProbeError::Unavailable {
            metric,
            reason: "scripted failure".to_string(),
        }
    }

    impl SystemProvider for FakeProvider {
        fn cpu_percent(&mut self) -> Result<f64, ProbeError> {
            self.cpu_calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_cpu {
                panic!("scripted provider panic");
            }
            if let Some(delay) = self.cpu_delay {
                std::thread::sleep(delay);
            }
            self.cpu.ok_or_else(|| unavailable("cpu"))
        }

        fn memory_percent(&mut self) -> Result<f64, ProbeError> {
            self.mem.ok_or_else(|| unavailable("memory"))
        }

        fn swap_percent(&mut self) -> Result<f64, ProbeError> {
            self.swap.ok_or_else(|| unavailable("swap"))
        }

        fn disk_percent(&mut self, _path: &Path) -> Result<f64, ProbeError> {
            self.disk.ok_or_else(|| unavailable("disk"))
        }

        fn battery_percent(&mut self) -> Result<Option<f64>, ProbeError> {
            self.battery.ok_or(ProbeError::Unsupported("battery"))
        }

        fn pids(&mut self) -> Result<Vec<u32>, ProbeError> {
            self.pids.clone().ok_or_else(|| unavailable("pids"))
        }

        fn net_io_counters(&mut self) -> Result<NetCounters, ProbeError> {
            self.net.ok_or_else(|| unavailable("net"))
        }

        fn net_connections(&mut self) -> Result<Vec<Connection>, ProbeError> {
            self.connections
                .clone()
                .ok_or_else(|| unavailable("connections"))
        }

        fn process_name(&mut self, pid: u32) -> Result<String, ProbeError> {
            self.names
                .get(&pid)
                .cloned()
                .ok_or(ProbeError::NoSuchProcess(pid))
        }
    }
}
