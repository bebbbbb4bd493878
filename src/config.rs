use crate::generate::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cpu_stability: CpuStabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_automation_enabled")]
    pub automation_enabled: bool,
    #[serde(default = "default_cleanup_period_mins")]
    pub cleanup_period_mins: u64,
    #[serde(default = "default_backup_period_mins")]
    pub backup_period_mins: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Path whose filesystem is reported as disk usage; working directory
    /// when unset.
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    /// Replaces the platform temp directory list when non-empty.
    #[serde(default)]
    pub cleanup_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_backend")]
    pub default_backend: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub llama_server_url: Option<String>,
    #[serde(default = "default_hf_token_env")]
    pub hf_token_env: String,
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default)]
    pub hf_model: Option<String>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub webui_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CpuStabilityConfig {
    #[serde(default = "default_stability_samples")]
    pub samples: u32,
    #[serde(default = "default_stability_spacing_ms")]
    pub spacing_ms: u64,
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            monitor: MonitorConfig::default(),
            llm: LlmConfig::default(),
            cpu_stability: CpuStabilityConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            automation_enabled: default_automation_enabled(),
            cleanup_period_mins: default_cleanup_period_mins(),
            backup_period_mins: default_backup_period_mins(),
            stop_timeout_secs: default_stop_timeout_secs(),
            disk_path: None,
            cleanup_dirs: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn resolved_disk_path(&self) -> PathBuf {
        self.disk_path
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            llama_server_url: None,
            hf_token_env: default_hf_token_env(),
            hf_token: None,
            hf_model: None,
            remote_url: None,
            webui_url: None,
        }
    }
}

impl Default for CpuStabilityConfig {
    fn default() -> Self {
        Self {
            samples: default_stability_samples(),
            spacing_ms: default_stability_spacing_ms(),
            variance_threshold: default_variance_threshold(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("environment variable {var}={value:?} is invalid: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    /// Loads the YAML file when it exists (defaults otherwise), then applies
    /// environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let mut cfg = if path_ref.exists() {
            Self::parse_file(path_ref)?
        } else {
            Self::default()
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg = Self::parse_file(path.as_ref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let path_display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(listen) = get("OSAID_LISTEN") {
            self.listen = listen;
        } else if get("HOST").is_some() || get("PORT").is_some() {
            let current: Option<SocketAddr> = self.listen.parse().ok();
            let host = get("HOST")
                .or_else(|| current.map(|a| a.ip().to_string()))
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let port = get("PORT")
                .or_else(|| current.map(|a| a.port().to_string()))
                .unwrap_or_else(|| "8000".to_string());
            self.listen = format!("{host}:{port}");
        }

        if let Some(v) = get("MONITOR_INTERVAL_SECONDS") {
            self.monitor.interval_secs = parse_env("MONITOR_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("MONITOR_AUTOMATION_ENABLED") {
            self.monitor.automation_enabled = parse_bool_env("MONITOR_AUTOMATION_ENABLED", &v)?;
        }
        if let Some(v) = get("MONITOR_CLEANUP_PERIOD_MINUTES") {
            self.monitor.cleanup_period_mins = parse_env("MONITOR_CLEANUP_PERIOD_MINUTES", &v)?;
        }
        if let Some(v) = get("MONITOR_BACKUP_PERIOD_MINUTES") {
            self.monitor.backup_period_mins = parse_env("MONITOR_BACKUP_PERIOD_MINUTES", &v)?;
        }
        if let Some(v) = get("MONITOR_STOP_TIMEOUT_SECONDS") {
            self.monitor.stop_timeout_secs = parse_env("MONITOR_STOP_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("MONITOR_DISK_PATH") {
            self.monitor.disk_path = Some(PathBuf::from(v));
        }

        if let Some(v) = get("WEB_BACKEND") {
            self.llm.default_backend = v;
        }
        if let Some(v) = get("LLAMA_SERVER_URL") {
            self.llm.llama_server_url = Some(v);
        }
        if let Some(v) = get("HF_MODEL") {
            self.llm.hf_model = Some(v);
        }
        if let Some(v) = get(&self.llm.hf_token_env) {
            self.llm.hf_token = Some(v);
        }
        if let Some(v) = get("REMOTE_API_URL") {
            self.llm.remote_url = Some(v);
        }
        if let Some(v) = get("WEBUI_URL") {
            self.llm.webui_url = Some(v);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }

        validate_monitor(&self.monitor)?;
        validate_llm(&self.llm)?;
        validate_cpu_stability(&self.cpu_stability)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_monitor(cfg: &MonitorConfig) -> Result<(), ConfigError> {
    if cfg.interval_secs < 1 {
        return Err(ConfigError::Validation(
            "monitor.interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.cleanup_period_mins < 1 {
        return Err(ConfigError::Validation(
            "monitor.cleanup_period_mins must be >= 1".to_string(),
        ));
    }
    if cfg.backup_period_mins < 1 {
        return Err(ConfigError::Validation(
            "monitor.backup_period_mins must be >= 1".to_string(),
        ));
    }
    if cfg.stop_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "monitor.stop_timeout_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_llm(cfg: &LlmConfig) -> Result<(), ConfigError> {
    if let Err(err) = cfg.default_backend.parse::<Backend>() {
        return Err(ConfigError::Validation(format!("llm.default_backend: {err}")));
    }
    if cfg.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be > 0".to_string(),
        ));
    }
    if cfg.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_cpu_stability(cfg: &CpuStabilityConfig) -> Result<(), ConfigError> {
    if cfg.samples < 1 {
        return Err(ConfigError::Validation(
            "cpu_stability.samples must be >= 1".to_string(),
        ));
    }
    if cfg.variance_threshold <= 0.0 {
        return Err(ConfigError::Validation(
            "cpu_stability.variance_threshold must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Env {
        var,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_bool_env(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

const fn default_interval_secs() -> u64 {
    5
}

const fn default_automation_enabled() -> bool {
    true
}

const fn default_cleanup_period_mins() -> u64 {
    15
}

const fn default_backup_period_mins() -> u64 {
    60
}

const fn default_stop_timeout_secs() -> u64 {
    2
}

fn default_backend() -> String {
    "auto".to_string()
}

const fn default_max_tokens() -> u32 {
    50
}

const fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_hf_token_env() -> String {
    "HF_TOKEN".to_string()
}

const fn default_stability_samples() -> u32 {
    5
}

const fn default_stability_spacing_ms() -> u64 {
    300
}

const fn default_variance_threshold() -> f64 {
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.monitor.interval_secs, 5);
        assert!(cfg.monitor.automation_enabled);
        assert_eq!(cfg.monitor.cleanup_period_mins, 15);
        assert_eq!(cfg.monitor.backup_period_mins, 60);
        assert_eq!(cfg.monitor.stop_timeout_secs, 2);
        assert_eq!(cfg.cpu_stability.samples, 5);
        assert_eq!(cfg.cpu_stability.spacing_ms, 300);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example is valid");
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("monitor:\n  interval_secs: 10\n").unwrap();
        assert_eq!(cfg.monitor.interval_secs, 10);
        assert_eq!(cfg.monitor.cleanup_period_mins, 15);
        assert_eq!(cfg.listen, "127.0.0.1:8000");
    }

    #[test]
    fn env_overrides_monitor_settings() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("MONITOR_INTERVAL_SECONDS", "9"),
            ("MONITOR_AUTOMATION_ENABLED", "false"),
            ("MONITOR_CLEANUP_PERIOD_MINUTES", "30"),
            ("MONITOR_BACKUP_PERIOD_MINUTES", "120"),
            ("MONITOR_STOP_TIMEOUT_SECONDS", "4"),
            ("WEB_BACKEND", "mock"),
        ]))
        .unwrap();

        assert_eq!(cfg.monitor.interval_secs, 9);
        assert!(!cfg.monitor.automation_enabled);
        assert_eq!(cfg.monitor.cleanup_period_mins, 30);
        assert_eq!(cfg.monitor.backup_period_mins, 120);
        assert_eq!(cfg.monitor.stop_timeout_secs, 4);
        assert_eq!(cfg.llm.default_backend, "mock");
    }

    #[test]
    fn host_and_port_compose_listen() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("PORT", "9100")])).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9100");

        cfg.apply_env(env(&[("HOST", "0.0.0.0")])).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9100");
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env(env(&[("MONITOR_INTERVAL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env {
                var: "MONITOR_INTERVAL_SECONDS",
                ..
            }
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut cfg = Config::default();
        cfg.monitor.interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut cfg = Config::default();
        cfg.llm.default_backend = "gpt-over-carrier-pigeon".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        Config::load(dir.path().join("absent.yaml")).expect("defaults load");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "monitor: [not, a, map").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
