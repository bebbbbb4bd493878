//! Stateless advice built from one ad-hoc snapshot: suggestions filtered by
//! privacy level, maintenance and optimization tips, and an anomaly score.

use crate::collectors::{Snapshot, SystemProvider};
use serde::Serialize;
use tracing::debug;

const GAME_MARKERS: &[&str] = &[
    "steam",
    "epicgameslauncher",
    "battle.net",
    "fortnite",
    "valorant",
];
const WORK_MARKERS: &[&str] = &[
    "code", "pycharm", "idea", "chrome", "firefox", "winword", "excel",
];
const GAMING_MIN_CPU: f64 = 40.0;
const IDLE_MAX_CPU: f64 = 5.0;
/// Context inference looks at no more than this many processes.
const MAX_CONTEXT_PROCESSES: usize = 500;

pub const HEALTHY: &str = "System looks healthy. No action recommended right now.";
pub const NO_MAINTENANCE: &str = "No maintenance concerns detected.";
pub const NO_OPTIMIZATION: &str = "No optimization needed right now.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Strict,
    #[default]
    Balanced,
    Open,
}

impl PrivacyLevel {
    /// Unknown or missing levels fall back to `balanced`.
    pub fn from_query(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("strict") => PrivacyLevel::Strict,
            Some("open") => PrivacyLevel::Open,
            _ => PrivacyLevel::Balanced,
        }
    }

    /// Whether process names may be looked at at all.
    pub fn allows_context(self) -> bool {
        self != PrivacyLevel::Strict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageContext {
    Gaming,
    Work,
    Idle,
    Unknown,
}

impl UsageContext {
    fn tip(self) -> Option<&'static str> {
        match self {
            UsageContext::Gaming => Some(
                "Gaming detected: enable high-performance mode and pause non-essential updates.",
            ),
            UsageContext::Work => Some(
                "Work mode: prioritize editor/IDE and browser tabs; pause large background downloads.",
            ),
            UsageContext::Idle => {
                Some("Idle detected: good time to run cleanup, backups, and updates.")
            }
            UsageContext::Unknown => None,
        }
    }
}

/// Without any process names the context is unknown, whatever the CPU says.
pub fn infer_context<'a>(
    process_names: impl IntoIterator<Item = &'a str>,
    cpu_percent: Option<f64>,
) -> UsageContext {
    let mut seen = false;
    let mut gaming = false;
    let mut working = false;
    for name in process_names {
        seen = true;
        let name = name.to_ascii_lowercase();
        gaming |= GAME_MARKERS.iter().any(|m| name.contains(m));
        working |= WORK_MARKERS.iter().any(|m| name.contains(m));
    }

    if !seen {
        return UsageContext::Unknown;
    }
    let cpu = cpu_percent.unwrap_or(0.0);
    if gaming && cpu >= GAMING_MIN_CPU {
        UsageContext::Gaming
    } else if working {
        UsageContext::Work
    } else if cpu_percent.is_some_and(|c| c < IDLE_MAX_CPU) {
        UsageContext::Idle
    } else {
        UsageContext::Unknown
    }
}

/// Names of the first running processes the provider can still resolve.
pub fn collect_process_names(provider: &mut dyn SystemProvider) -> Vec<String> {
    let pids = match provider.pids() {
        Ok(pids) => pids,
        Err(err) => {
            debug!(error = %err, "process list unavailable for context inference");
            return Vec::new();
        }
    };
    pids.into_iter()
        .take(MAX_CONTEXT_PROCESSES)
        .filter_map(|pid| provider.process_name(pid).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestions {
    pub suggestions: Vec<String>,
    pub privacy: PrivacyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<UsageContext>,
}

/// `process_names` is ignored under strict privacy. The healthy message is
/// only given when there is no other tip, the context tip included.
pub fn build_suggestions(
    snapshot: &Snapshot,
    privacy: PrivacyLevel,
    process_names: &[String],
) -> Suggestions {
    let context = privacy
        .allows_context()
        .then(|| infer_context(process_names.iter().map(String::as_str), snapshot.cpu_percent));

    let mut suggestions: Vec<String> = context
        .and_then(UsageContext::tip)
        .map(str::to_string)
        .into_iter()
        .collect();

    if snapshot.cpu_percent.is_some_and(|v| v > 85.0) {
        suggestions.push(
            "High CPU usage: consider closing heavy apps or lowering background task priority."
                .to_string(),
        );
    }
    if snapshot.mem_percent.is_some_and(|v| v > 90.0) {
        suggestions.push("Memory pressure: close unused tabs/apps or add swap.".to_string());
    }
    if snapshot.disk_percent.is_some_and(|v| v > 90.0) {
        suggestions.push("Disk near full: clean temporary files and large unused files.".to_string());
    }
    if suggestions.is_empty() {
        suggestions.push(HEALTHY.to_string());
    }

    Suggestions {
        suggestions,
        privacy,
        context,
    }
}

pub fn maintenance_tips(snapshot: &Snapshot) -> Vec<String> {
    let mut tips = Vec::new();
    if snapshot.disk_percent.is_some_and(|v| v > 90.0) {
        tips.push(
            "Disk failure risk increases when near full; consider cleanup or expansion."
                .to_string(),
        );
    }
    if snapshot.mem_percent.is_some_and(|v| v > 90.0) {
        tips.push(
            "System may become unstable under memory pressure; close apps or add RAM/swap."
                .to_string(),
        );
    }
    if snapshot.cpu_percent.is_some_and(|v| v > 95.0) {
        tips.push(
            "Sustained CPU saturation can cause throttling; improve cooling or limit workloads."
                .to_string(),
        );
    }
    if tips.is_empty() {
        tips.push(NO_MAINTENANCE.to_string());
    }
    tips
}

pub fn optimization_tips(snapshot: &Snapshot) -> Vec<String> {
    let mut tips = Vec::new();
    if snapshot.cpu_percent.is_some_and(|v| v > 80.0) {
        tips.push("Lower priority of background processes and pause heavy indexing.".to_string());
    }
    if snapshot.mem_percent.is_some_and(|v| v > 85.0) {
        tips.push("Free caches, close unused tabs, or expand swap.".to_string());
    }
    if snapshot.disk_percent.is_some_and(|v| v > 85.0) {
        tips.push("Limit background writes and offload logs to slower intervals.".to_string());
    }
    if tips.is_empty() {
        tips.push(NO_OPTIMIZATION.to_string());
    }
    tips
}

/// 0.0 ..= 1.0. Without a socket listing there is nothing to score.
pub fn anomaly_score(listening: Option<usize>, process_count: Option<u64>) -> f64 {
    let Some(listening) = listening else {
        return 0.0;
    };
    let mut score = 0.0;
    if listening > 50 {
        score += 0.5;
    }
    if process_count.is_some_and(|c| c > 500) {
        score += 0.5;
    }
    f64::min(score, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub maintenance: Vec<String>,
    pub optimization: Vec<String>,
    pub anomaly_score: f64,
}

pub fn health_report(snapshot: &Snapshot, listening: Option<usize>) -> HealthReport {
    HealthReport {
        maintenance: maintenance_tips(snapshot),
        optimization: optimization_tips(snapshot),
        anomaly_score: anomaly_score(listening, snapshot.process_count),
    }
}
