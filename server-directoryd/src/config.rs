use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::LAN_SERVICE_TYPE;
use shared::record::RefreshPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_refresh_tick")]
    pub refresh_tick_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_session_end_cooldown")]
    pub session_end_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub master_urls: Vec<String>,
    #[serde(default = "default_master_timeout")]
    pub master_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub lan_enabled: bool,
    #[serde(default = "default_lan_service_type")]
    pub lan_service_type: String,
    #[serde(default = "default_lan_window")]
    pub lan_window_ms: u64,
    #[serde(default = "default_true")]
    pub saved_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Upper bound on simultaneous probes during a sweep
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub driver_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_root")]
    pub root: PathBuf,
}

fn default_scan_interval() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_refresh_tick() -> u64 {
    1
}

fn default_stale_after() -> u64 {
    5
}

fn default_session_end_cooldown() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_lan_service_type() -> String {
    LAN_SERVICE_TYPE.to_string()
}

fn default_master_timeout() -> u64 {
    10_000
}

fn default_lan_window() -> u64 {
    1500
}

fn default_concurrency() -> usize {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/server-directory/directory.db")
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_content_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            sweep_interval_secs: default_sweep_interval(),
            refresh_tick_secs: default_refresh_tick(),
            stale_after_secs: default_stale_after(),
            session_end_cooldown_secs: default_session_end_cooldown(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            master_urls: Vec::new(),
            master_timeout_ms: default_master_timeout(),
            lan_enabled: true,
            lan_service_type: default_lan_service_type(),
            lan_window_ms: default_lan_window(),
            saved_enabled: true,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: default_content_root(),
        }
    }
}

impl DirectoryConfig {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            stale_after: chrono::Duration::seconds(self.stale_after_secs as i64),
            session_end_cooldown: chrono::Duration::seconds(self.session_end_cooldown_secs as i64),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(config.probe.concurrency > 0, "probe.concurrency must be at least 1");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [launcher]
            program = "/opt/game/acs.exe"
            driver_name = "Tester"
            "#,
        )
        .unwrap();

        assert_eq!(config.probe.concurrency, 30);
        assert_eq!(config.directory.stale_after_secs, 5);
        assert_eq!(config.sources.lan_service_type, LAN_SERVICE_TYPE);
        assert!(config.sources.master_urls.is_empty());
        assert_eq!(config.api.listen, "[::]:8054");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Config::parse(
            r#"
            [probe]
            concurrency = 0

            [launcher]
            program = "acs"
            driver_name = "Tester"
            "#,
        );
        assert!(result.is_err());
    }
}
