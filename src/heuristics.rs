//! Fixed-threshold advisory rules. Nothing here ever acts on the host; the
//! output is text for the log.

use crate::collectors::{ConnStatus, Connection, Snapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

pub const HIGH_CPU_PERCENT: f64 = 85.0;
pub const MEMORY_PRESSURE_PERCENT: f64 = 90.0;
pub const DISK_USAGE_PERCENT: f64 = 90.0;
pub const LISTENING_SOCKETS_LIMIT: usize = 50;
pub const TOP_CONNECTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    HighCpu,
    MemoryPressure,
    DiskUsage,
    ListeningSockets,
    TopConnections,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advisory {
    pub severity: Severity,
    pub kind: AdvisoryKind,
    pub message: String,
}

impl Advisory {
    fn warning(kind: AdvisoryKind, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessConnections {
    pub pid: u32,
    pub name: Option<String>,
    pub count: usize,
}

impl fmt::Display for ProcessConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}(pid={}) connections={}", self.pid, self.count),
            None => write!(f, "pid={} connections={}", self.pid, self.count),
        }
    }
}

/// Per-tick socket summary; rebuilt every tick, never carried over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub listening: usize,
    pub top: Vec<ProcessConnections>,
}

/// Counts listening sockets and ranks processes by established outbound
/// connections. Ties are ordered by pid so output is stable across ticks.
pub fn build_connection_report(
    connections: &[Connection],
    mut resolve_name: impl FnMut(u32) -> Option<String>,
) -> ConnectionReport {
    let listening = connections
        .iter()
        .filter(|c| c.status == ConnStatus::Listen)
        .count();

    let mut by_pid: HashMap<u32, usize> = HashMap::new();
    for conn in connections {
        if conn.status != ConnStatus::Established || conn.remote.is_none() {
            continue;
        }
        if let Some(pid) = conn.pid {
            *by_pid.entry(pid).or_default() += 1;
        }
    }

    let mut ranked: Vec<(u32, usize)> = by_pid.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(TOP_CONNECTIONS);

    let top = ranked
        .into_iter()
        .map(|(pid, count)| ProcessConnections {
            pid,
            name: resolve_name(pid),
            count,
        })
        .collect();

    ConnectionReport { listening, top }
}

/// Runs every rule against one snapshot. `connections` is `None` when socket
/// enumeration failed this tick, which silences the socket rules.
pub fn evaluate(snapshot: &Snapshot, connections: Option<&ConnectionReport>) -> Vec<Advisory> {
    let mut out = Vec::new();

    if let Some(cpu) = snapshot.cpu_percent.filter(|v| *v >= HIGH_CPU_PERCENT) {
        out.push(Advisory::warning(
            AdvisoryKind::HighCpu,
            format!("Sustained high CPU detected ({cpu:.1}%). Consider throttling background tasks."),
        ));
    }
    if let Some(mem) = snapshot.mem_percent.filter(|v| *v >= MEMORY_PRESSURE_PERCENT) {
        out.push(Advisory::warning(
            AdvisoryKind::MemoryPressure,
            format!(
                "Memory pressure high ({mem:.1}%). Consider freeing caches or closing idle apps."
            ),
        ));
    }
    if let Some(disk) = snapshot.disk_percent.filter(|v| *v >= DISK_USAGE_PERCENT) {
        out.push(Advisory::warning(
            AdvisoryKind::DiskUsage,
            format!("Disk usage high ({disk:.1}%). Cleanup recommended."),
        ));
    }

    let Some(report) = connections else {
        return out;
    };

    if report.listening > LISTENING_SOCKETS_LIMIT {
        out.push(Advisory::warning(
            AdvisoryKind::ListeningSockets,
            format!(
                "Large number of listening sockets detected: {}",
                report.listening
            ),
        ));
    }
    if !report.top.is_empty() {
        let lines: Vec<String> = report.top.iter().map(ToString::to_string).collect();
        out.push(Advisory {
            severity: Severity::Info,
            kind: AdvisoryKind::TopConnections,
            message: format!("Top outbound connections: {}", lines.join(", ")),
        });
    }

    out
}

pub fn log_advisories(advisories: &[Advisory]) {
    for advisory in advisories {
        match advisory.severity {
            Severity::Info => info!(kind = ?advisory.kind, "{}", advisory.message),
            Severity::Warning => warn!(kind = ?advisory.kind, "{}", advisory.message),
        }
    }
}
