use crate::assistant::anomaly_score;
use crate::collectors::{clamp_percent, SystemProvider};
use crate::config::CpuStabilityConfig;
use crate::heuristics::build_connection_report;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const SCAN_STUB_MESSAGE: &str = "No known malware signatures detected (stub).";
const UNKNOWN_HINT: &str =
    "No matching action. Try: 'check cpu stability' or 'do a virus scan'.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    CpuStability,
    MalwareScan,
    Unknown,
}

/// Keyword match on whole words, case-insensitive.
pub fn classify(text: &str) -> Result<Intent, CommandError> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        return Err(CommandError::Empty);
    }
    let has = |w: &str| words.iter().any(|x| x == w);

    if has("cpu") && (has("stable") || has("stability") || has("check")) {
        Ok(Intent::CpuStability)
    } else if has("virus") || has("malware") || has("scan") {
        Ok(Intent::MalwareScan)
    } else {
        Ok(Intent::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStability {
    pub samples: Vec<f64>,
    pub average: f64,
    pub variance: f64,
    pub stable: bool,
}

impl CpuStability {
    /// Population variance over the collected samples; an empty set is
    /// reported as unstable.
    pub fn from_samples(samples: Vec<f64>, variance_threshold: f64) -> Self {
        if samples.is_empty() {
            return Self {
                samples,
                average: 0.0,
                variance: 0.0,
                stable: false,
            };
        }
        let n = samples.len() as f64;
        let average = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - average).powi(2)).sum::<f64>() / n;
        Self {
            stable: variance < variance_threshold,
            samples,
            average,
            variance,
        }
    }
}

/// Takes `cfg.samples` CPU readings, waiting `cfg.spacing_ms` before each.
/// Blocks the calling thread for the whole run.
pub fn cpu_stability(provider: &mut dyn SystemProvider, cfg: &CpuStabilityConfig) -> CpuStability {
    let spacing = Duration::from_millis(cfg.spacing_ms);
    let mut samples = Vec::with_capacity(cfg.samples as usize);
    for _ in 0..cfg.samples {
        // Every sample covers its own window, the first one included.
        if !spacing.is_zero() {
            std::thread::sleep(spacing);
        }
        match provider.cpu_percent() {
            Ok(value) => samples.extend(clamp_percent(value)),
            Err(err) => debug!(error = %err, "cpu sample skipped"),
        }
    }
    CpuStability::from_samples(samples, cfg.variance_threshold)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum CommandOutcome {
    CpuStability(CpuStability),
    MalwareScan { message: String, anomaly_score: f64 },
    Unknown { message: String },
}

pub fn execute_command(
    text: &str,
    provider: &mut dyn SystemProvider,
    cfg: &CpuStabilityConfig,
) -> Result<CommandOutcome, CommandError> {
    let intent = classify(text)?;
    info!(?intent, "executing command");

    let outcome = match intent {
        Intent::CpuStability => CommandOutcome::CpuStability(cpu_stability(provider, cfg)),
        Intent::MalwareScan => {
            let listening = provider
                .net_connections()
                .map(|conns| build_connection_report(&conns, |_| None).listening)
                .ok();
            let process_count = provider.pids().ok().map(|p| p.len() as u64);
            CommandOutcome::MalwareScan {
                message: SCAN_STUB_MESSAGE.to_string(),
                anomaly_score: anomaly_score(listening, process_count),
            }
        }
        Intent::Unknown => CommandOutcome::Unknown {
            message: UNKNOWN_HINT.to_string(),
        },
    };
    Ok(outcome)
}
