use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}")]
    ReadFailed(path::PathBuf),
    #[error("failed to write config file {0}")]
    WriteFailed(path::PathBuf),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("no config directory available (neither XDG_CONFIG_HOME nor HOME is set)")]
    ConfigPathUnavailable,
}

/// Inclusive bounds for every tunable, applied after file and env loading.
pub mod limits {
    pub const POLL_INTERVAL_SECONDS: (u64, u64) = (15, 600);
    pub const MAX_CONCURRENCY: (usize, usize) = (1, 20);
    pub const RETENTION_DAYS: (u32, u32) = (7, 365);
    pub const OFFICIAL_STATUS_INTERVAL_SECONDS: (u64, u64) = (60, 3600);
    pub const HISTORY_WINDOW: (usize, usize) = (1, 500);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub history: HistoryConfig,
    pub official_status: OfficialStatusConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global check interval; targets may override it with `pollIntervalSeconds`.
    pub poll_interval_seconds: u64,
    pub max_concurrency: usize,
    /// Lease owner id. Empty means "generate one at startup".
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_days: u32,
    /// Outcomes per target included in a snapshot.
    pub window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficialStatusConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub openai_url: String,
    pub anthropic_url: String,
    pub gemini_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval_seconds: 60, max_concurrency: 5, node_id: String::new() }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { retention_days: 30, window: 60 }
    }
}

impl Default for OfficialStatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 300,
            openai_url: "https://status.openai.com/api/v2/status.json".into(),
            anthropic_url: "https://status.anthropic.com/api/v2/status.json".into(),
            gemini_url: "https://status.cloud.google.com/incidents.json".into(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "modelwatch.db".into(), max_connections: 8 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            history: HistoryConfig::default(),
            official_status: OfficialStatusConfig::default(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/modelwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("modelwatch/config.toml"))
}

/// Read and parse an environment variable, ignoring unset or malformed values.
fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(val) => {
            let parsed = val.trim().parse().ok();
            if parsed.is_none() {
                tracing::warn!(variable = name, value = %val, "Ignoring unparsable environment override");
            }
            parsed
        }
        Err(_) => None,
    }
}

fn clamp<T: Ord + Copy>(value: T, (min, max): (T, T)) -> T {
    value.clamp(min, max)
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Scheduler")?;
        write_1(f, "Poll Interval (s)", &self.scheduler.poll_interval_seconds)?;
        write_1(f, "Max Concurrency", &self.scheduler.max_concurrency)?;
        write_1(f, "Node Id", &self.scheduler.node_id)?;
        write_1(f, "Lease TTL (s)", &self.lease_ttl().as_secs())?;
        write_title_1(f, "History")?;
        write_1(f, "Retention (days)", &self.history.retention_days)?;
        write_1(f, "Snapshot Window", &self.history.window)?;
        write_title_1(f, "Official Status")?;
        write_1(f, "Enabled", &self.official_status.enabled)?;
        write_1(f, "Poll Interval (s)", &self.official_status.poll_interval_seconds)?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Max Connections", &self.database.max_connections)?;
        write_title_1(f, "Server")?;
        write_1(f, "Bind Address", &self.server.bind)?;

        Ok(())
    }
}

impl Config {
    /// Load the configuration the way both binaries do it: `.env`, then the
    /// TOML file (created with defaults if missing), then `MODELWATCH_*`
    /// environment overrides, then range clamping.
    pub fn load(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_config(optional_path)?;
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/modelwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|_err| ConfigError::ReadFailed(config_path.clone()))?;
            Self::from_toml_str(&raw_string)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::ParseFailed(err.to_string()))
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)
            .map_err(|err| ConfigError::ParseFailed(err.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_err| ConfigError::WriteFailed(path.into()))?;
        }

        std::fs::write(path, config_str).map_err(|_err| ConfigError::WriteFailed(path.into()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_override("MODELWATCH_POLL_INTERVAL_SECONDS") {
            self.scheduler.poll_interval_seconds = v;
        }
        if let Some(v) = env_override("MODELWATCH_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = v;
        }
        if let Some(v) = env_override("MODELWATCH_NODE_ID") {
            self.scheduler.node_id = v;
        }
        if let Some(v) = env_override("MODELWATCH_HISTORY_RETENTION_DAYS") {
            self.history.retention_days = v;
        }
        if let Some(v) = env_override("MODELWATCH_HISTORY_WINDOW") {
            self.history.window = v;
        }
        if let Some(v) = env_override("MODELWATCH_OFFICIAL_STATUS_INTERVAL_SECONDS") {
            self.official_status.poll_interval_seconds = v;
        }
        if let Some(v) = env_override("MODELWATCH_OFFICIAL_STATUS_ENABLED") {
            self.official_status.enabled = v;
        }
        if let Some(v) = env_override("MODELWATCH_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = env_override("MODELWATCH_BIND") {
            self.server.bind = v;
        }
    }

    /// Clamp every numeric setting into its allowed range and fill in a node id.
    pub fn normalize(&mut self) {
        self.scheduler.poll_interval_seconds =
            clamp(self.scheduler.poll_interval_seconds, limits::POLL_INTERVAL_SECONDS);
        self.scheduler.max_concurrency =
            clamp(self.scheduler.max_concurrency, limits::MAX_CONCURRENCY);
        self.history.retention_days = clamp(self.history.retention_days, limits::RETENTION_DAYS);
        self.history.window = clamp(self.history.window, limits::HISTORY_WINDOW);
        self.official_status.poll_interval_seconds = clamp(
            self.official_status.poll_interval_seconds,
            limits::OFFICIAL_STATUS_INTERVAL_SECONDS,
        );
        self.database.max_connections = self.database.max_connections.max(1);

        if self.scheduler.node_id.trim().is_empty() {
            self.scheduler.node_id = format!("node-{}", uuid::Uuid::new_v4());
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_seconds)
    }

    /// A leader renews on every tick, so two intervals survive one slow tick.
    pub fn lease_ttl(&self) -> Duration {
        self.poll_interval() * 2
    }

    pub fn official_status_interval(&self) -> Duration {
        Duration::from_secs(self.official_status.poll_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_within_limits() {
        let mut config = Config::default();
        config.normalize();
        assert_eq!(config.scheduler.poll_interval_seconds, 60);
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert_eq!(config.history.retention_days, 30);
        assert_eq!(config.official_status.poll_interval_seconds, 300);
        assert!(config.scheduler.node_id.starts_with("node-"));
        assert_eq!(config.lease_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut config = Config::from_toml_str(
            r#"
            [scheduler]
            poll_interval_seconds = 1
            max_concurrency = 100
            node_id = "alpha"

            [history]
            retention_days = 1000
            window = 0

            [official_status]
            poll_interval_seconds = 5
            "#,
        )
        .unwrap();
        config.normalize();

        assert_eq!(config.scheduler.poll_interval_seconds, 15);
        assert_eq!(config.scheduler.max_concurrency, 20);
        assert_eq!(config.scheduler.node_id, "alpha");
        assert_eq!(config.history.retention_days, 365);
        assert_eq!(config.history.window, 1);
        assert_eq!(config.official_status.poll_interval_seconds, 60);
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config = Config::from_toml_str("[database]\npath = \"/tmp/x.db\"\n").unwrap();
        assert_eq!(config.database.path, "/tmp/x.db");
        assert_eq!(config.scheduler.poll_interval_seconds, 60);
        assert!(config.official_status.enabled);
    }

    #[test]
    fn test_from_config_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config");
        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert!(dir.path().join("nested/config.toml").exists());
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let err = Config::from_toml_str("[scheduler\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }
}
