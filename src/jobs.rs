use crate::config::MonitorConfig;
use crate::scheduler::{DuplicateJob, Job, JobError, Scheduler};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const TEMP_CLEANUP_JOB: &str = "temp-cleanup";
pub const BACKUP_JOB: &str = "backup";

/// Builds the standing automation registry from configuration.
pub fn build_scheduler(cfg: &MonitorConfig) -> Result<Scheduler, DuplicateJob> {
    let mut scheduler = Scheduler::new();
    let cleanup_dirs = if cfg.cleanup_dirs.is_empty() {
        candidate_temp_dirs()
    } else {
        cfg.cleanup_dirs.clone()
    };
    let cleanup_period = Duration::from_secs(cfg.cleanup_period_mins * 60);
    let backup_period = Duration::from_secs(cfg.backup_period_mins * 60);

    scheduler.register(
        TEMP_CLEANUP_JOB,
        cleanup_period,
        Box::new(TempCleanup::new(cleanup_dirs)),
    )?;
    scheduler.register(BACKUP_JOB, backup_period, Box::new(BackupStub))?;

    info!(
        cleanup_every = %humantime::format_duration(cleanup_period),
        backup_every = %humantime::format_duration(backup_period),
        "automation jobs scheduled"
    );
    Ok(scheduler)
}

/// Temp directories worth sweeping on this platform, deduplicated, existing
/// ones only.
pub fn candidate_temp_dirs() -> Vec<PathBuf> {
    let mut raw: Vec<PathBuf> = ["TEMP", "TMP", "TMPDIR"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .collect();
    raw.push(std::env::temp_dir());
    #[cfg(target_os = "windows")]
    if let Some(local) = std::env::var_os("LOCALAPPDATA") {
        raw.push(PathBuf::from(local).join("Temp"));
    }

    let mut out: Vec<PathBuf> = Vec::new();
    for dir in raw {
        if !dir.is_dir() {
            continue;
        }
        let key = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        if !out.iter().any(|d| d == &key) {
            out.push(key);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed: u64,
    pub skipped: u64,
}

pub struct TempCleanup {
    dirs: Vec<PathBuf>,
}

impl TempCleanup {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Removes regular files directly inside each directory. Subdirectories
    /// and symlinks are left alone; per-file errors are counted, not raised.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for dir in &self.dirs {
            sweep_dir(dir, &mut stats);
        }
        stats
    }
}

fn sweep_dir(dir: &Path, stats: &mut SweepStats) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "temp dir unreadable");
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else {
            stats.skipped += 1;
            continue;
        };
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => stats.removed += 1,
            Err(err) => {
                debug!(path = %entry.path().display(), error = %err, "temp file skipped");
                stats.skipped += 1;
            }
        }
    }
}

impl Job for TempCleanup {
    fn run(&mut self) -> Result<String, JobError> {
        let stats = self.sweep();
        Ok(format!(
            "cleaned {} temp files ({} skipped)",
            stats.removed, stats.skipped
        ))
    }
}

/// Placeholder for a real backup; only records that it was invoked.
pub struct BackupStub;

impl Job for BackupStub {
    fn run(&mut self) -> Result<String, JobError> {
        Ok("backup stub executed (no-op)".to_string())
    }
}
