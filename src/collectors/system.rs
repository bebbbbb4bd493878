use crate::collectors::{clamp_percent, Connection, NetCounters, ProbeError, SystemProvider};
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::time::Instant;
use sysinfo::{
    CpuExt, DiskExt, NetworkExt, NetworksExt, Pid, PidExt, ProcessExt, System, SystemExt,
};

/// Provider backed by `sysinfo`, with procfs/sysfs readers for the probes
/// `sysinfo` does not cover (sockets, battery).
pub struct SysinfoProvider {
    system: System,
    cpu_refreshed_at: Instant,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first real reading has a baseline.
        system.refresh_cpu();
        Self {
            system,
            cpu_refreshed_at: Instant::now(),
        }
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProvider for SysinfoProvider {
    /// Usage since the previous refresh. Blocks until at least
    /// `MINIMUM_CPU_UPDATE_INTERVAL` has passed since then.
    fn cpu_percent(&mut self) -> Result<f64, ProbeError> {
        let since = self.cpu_refreshed_at.elapsed();
        if let Some(remaining) = System::MINIMUM_CPU_UPDATE_INTERVAL.checked_sub(since) {
            std::thread::sleep(remaining);
        }
        self.system.refresh_cpu();
        self.cpu_refreshed_at = Instant::now();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(ProbeError::Unavailable {
                metric: "cpu",
                reason: "no cpus reported".to_string(),
            });
        }
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        let avg = (sum / cpus.len() as f32) as f64;
        clamp_percent(avg).ok_or_else(|| ProbeError::Unavailable {
            metric: "cpu",
            reason: "usage is not a number".to_string(),
        })
    }

    fn memory_percent(&mut self) -> Result<f64, ProbeError> {
        self.system.refresh_memory();
        ratio_percent(
            "memory",
            self.system.used_memory(),
            self.system.total_memory(),
        )
    }

    fn swap_percent(&mut self) -> Result<f64, ProbeError> {
        self.system.refresh_memory();
        // No swap configured reads as 0% used, the same as psutil-style tools.
        if self.system.total_swap() == 0 {
            return Ok(0.0);
        }
        ratio_percent("swap", self.system.used_swap(), self.system.total_swap())
    }

    fn disk_percent(&mut self, path: &Path) -> Result<f64, ProbeError> {
        self.system.refresh_disks_list();
        self.system.refresh_disks();
        let target = path.canonicalize()?;
        let disk = self
            .system
            .disks()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count())
            .ok_or_else(|| ProbeError::Unavailable {
                metric: "disk",
                reason: format!("no mount point contains {}", target.display()),
            })?;
        let total = disk.total_space();
        let used = total.saturating_sub(disk.available_space());
        ratio_percent("disk", used, total)
    }

    fn battery_percent(&mut self) -> Result<Option<f64>, ProbeError> {
        read_battery_percent()
    }

    fn pids(&mut self) -> Result<Vec<u32>, ProbeError> {
        self.system.refresh_processes();
        Ok(self
            .system
            .processes()
            .keys()
            .map(|pid| pid.as_u32())
            .collect())
    }

    fn net_io_counters(&mut self) -> Result<NetCounters, ProbeError> {
        self.system.refresh_networks_list();
        self.system.refresh_networks();
        let mut counters = NetCounters::default();
        for (_iface, data) in self.system.networks().iter() {
            counters.tx_bytes = counters.tx_bytes.saturating_add(data.total_transmitted());
            counters.rx_bytes = counters.rx_bytes.saturating_add(data.total_received());
        }
        Ok(counters)
    }

    fn net_connections(&mut self) -> Result<Vec<Connection>, ProbeError> {
        crate::collectors::sockets::read_inet_connections()
    }

    fn process_name(&mut self, pid: u32) -> Result<String, ProbeError> {
        let sys_pid = Pid::from_u32(pid);
        if !self.system.refresh_process(sys_pid) {
            return Err(ProbeError::NoSuchProcess(pid));
        }
        self.system
            .process(sys_pid)
            .map(|p| p.name().to_string())
            .ok_or(ProbeError::NoSuchProcess(pid))
    }
}

fn ratio_percent(metric: &'static str, used: u64, total: u64) -> Result<f64, ProbeError> {
    if total == 0 {
        return Err(ProbeError::Unavailable {
            metric,
            reason: "total is zero".to_string(),
        });
    }
    clamp_percent(used as f64 / total as f64 * 100.0).ok_or_else(|| ProbeError::Unavailable {
        metric,
        reason: "ratio is not a number".to_string(),
    })
}

#[cfg(target_os = "linux")]
fn read_battery_percent() -> Result<Option<f64>, ProbeError> {
    let Ok(entries) = fs::read_dir("/sys/class/power_supply") else {
        return Ok(None);
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        let kind = fs::read_to_string(dir.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        let raw = fs::read_to_string(dir.join("capacity"))?;
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|err| ProbeError::Unavailable {
                metric: "battery",
                reason: err.to_string(),
            })?;
        return Ok(clamp_percent(value));
    }
    Ok(None)
}

#[cfg(not(target_os = "linux"))]
fn read_battery_percent() -> Result<Option<f64>, ProbeError> {
    Err(ProbeError::Unsupported("battery"))
}
