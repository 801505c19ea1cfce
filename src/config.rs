// Configuration File Support
//
// Harness configuration: which server to launch, how long to wait for it,
// how to log and how batch runs retry. TOML format with environment
// variable overrides, loaded from ~/.config/paperprobe/config.toml by default.

use crate::mcp::retry::RetryConfig;
use crate::mcp::transport::{LaunchSpec, ShutdownPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// Server under test
    pub server: ServerConfig,

    /// Per-operation deadlines
    pub timeouts: TimeoutConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Batch download configuration
    pub batch: BatchConfig,
}

/// How to launch the research server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable to spawn (e.g., "rust-research-mcp")
    pub command: String,

    /// Extra arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Working directory of the server process
    pub working_dir: Option<PathBuf>,

    /// Server config file, passed as `--config <path>`
    pub config_file: Option<PathBuf>,

    /// Server log level, passed as `--log-level <level>`
    pub log_level: Option<String>,

    /// Environment variable that points the server at its download directory
    pub download_dir_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "rust-research-mcp".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            config_file: None,
            log_level: Some("error".to_string()),
            download_dir_env: "RSH_DOWNLOAD_DIRECTORY".to_string(),
        }
    }
}

/// Deadlines in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub initialize_secs: u64,
    pub request_secs: u64,
    pub search_secs: u64,
    pub download_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_secs: 10,
            request_secs: 30,
            search_secs: 30,
            download_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn initialize(&self) -> Duration {
        Duration::from_secs(self.initialize_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn search(&self) -> Duration {
        Duration::from_secs(self.search_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Batch run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BatchConfig {
    pub retry: RetrySettings,
}

/// Retry knobs for harness failures in batch runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

impl HarnessConfig {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults. Environment overrides are applied
    /// and the result is validated either way.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: HarnessConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/paperprobe/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "paperprobe", "paperprobe") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("paperprobe")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - PAPERPROBE_SERVER_COMMAND
    /// - PAPERPROBE_LOG_LEVEL
    /// - PAPERPROBE_LOG_FORMAT
    /// - PAPERPROBE_DOWNLOAD_TIMEOUT_SECS
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(command) = var("PAPERPROBE_SERVER_COMMAND") {
            if !command.trim().is_empty() {
                self.server.command = command;
            }
        }
        if let Some(level) = var("PAPERPROBE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("PAPERPROBE_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(secs) = var("PAPERPROBE_DOWNLOAD_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    self.timeouts.download_secs = secs;
                }
            }
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.server.command.trim().is_empty() {
            anyhow::bail!("Server command must not be empty");
        }
        if self.server.download_dir_env.trim().is_empty() {
            anyhow::bail!("Download directory variable name must not be empty");
        }

        let timeouts = [
            ("initialize", self.timeouts.initialize_secs),
            ("request", self.timeouts.request_secs),
            ("search", self.timeouts.search_secs),
            ("download", self.timeouts.download_secs),
            ("shutdown grace", self.timeouts.shutdown_grace_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                anyhow::bail!("The {} timeout must be > 0 seconds", name);
            }
        }

        if self.batch.retry.max_attempts == 0 {
            anyhow::bail!("Batch retry max_attempts must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Launch parameters for a server that downloads into `download_dir`
    pub fn launch_spec(&self, download_dir: &Path) -> LaunchSpec {
        let server = &self.server;
        let mut spec = LaunchSpec::new(&server.command)
            .shutdown(ShutdownPolicy::from_total(self.timeouts.shutdown_grace()));

        if let Some(config_file) = &server.config_file {
            spec = spec.arg("--config").arg(config_file.display().to_string());
        }
        if let Some(level) = &server.log_level {
            spec = spec.arg("--log-level").arg(level);
        }
        spec = spec.args(&server.args);

        for (key, value) in &server.env {
            spec = spec.env(key, value);
        }
        spec = spec.env(&server.download_dir_env, download_dir.display().to_string());

        if let Some(dir) = &server.working_dir {
            spec = spec.working_dir(dir);
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.server.command, "rust-research-mcp");
        assert_eq!(config.server.download_dir_env, "RSH_DOWNLOAD_DIRECTORY");
        assert_eq!(config.timeouts.download(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = HarnessConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = HarnessConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_command() {
        let mut config = HarnessConfig::default();
        config.server.command = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = HarnessConfig::default();
        config.timeouts.download_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("download"));
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let config = HarnessConfig::load_from_path("/nonexistent/paperprobe.toml").unwrap();
        assert_eq!(config.server.download_dir_env, "RSH_DOWNLOAD_DIRECTORY");
    }

    #[test]
    fn test_load_partial_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[server]
command = "/opt/research/rust-research-mcp"
args = ["--verbose"]
config_file = "/etc/research/config.toml"

[server.env]
RUST_BACKTRACE = "1"

[timeouts]
search_secs = 45

[batch.retry]
max_attempts = 5
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = HarnessConfig::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.server.command, "/opt/research/rust-research-mcp");
        assert_eq!(config.server.env["RUST_BACKTRACE"], "1");
        assert_eq!(config.timeouts.search_secs, 45);
        assert_eq!(config.timeouts.initialize_secs, 10);
        assert_eq!(config.batch.retry.max_attempts, 5);
        assert_eq!(config.batch.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[server\ncommand = ").unwrap();
        assert!(HarnessConfig::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: BTreeMap<&str, &str> = [
            ("PAPERPROBE_SERVER_COMMAND", "/usr/local/bin/research"),
            ("PAPERPROBE_DOWNLOAD_TIMEOUT_SECS", "120"),
            ("PAPERPROBE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        let config = HarnessConfig::default()
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.server.command, "/usr/local/bin/research");
        assert_eq!(config.timeouts.download_secs, 120);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");

        // Zero and unparsable timeouts keep the default
        for bad in ["0", "soon"] {
            let config = HarnessConfig::default().apply_overrides(|key| {
                (key == "PAPERPROBE_DOWNLOAD_TIMEOUT_SECS").then(|| bad.to_string())
            });
            assert_eq!(config.timeouts.download_secs, 60);
        }
    }

    #[test]
    fn test_launch_spec() {
        let mut config = HarnessConfig::default();
        config.server.config_file = Some(PathBuf::from("/etc/rsh.toml"));
        config.server.args = vec!["--extra".to_string()];

        let spec = config.launch_spec(Path::new("/tmp/run-1"));
        assert_eq!(spec.command, "rust-research-mcp");
        assert_eq!(
            spec.args,
            vec!["--config", "/etc/rsh.toml", "--log-level", "error", "--extra"]
        );
        assert_eq!(spec.env["RSH_DOWNLOAD_DIRECTORY"], "/tmp/run-1");
    }

    #[test]
    fn test_retry_settings() {
        let retry = RetrySettings::default().to_retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = HarnessConfig::default();
        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
    }
}
