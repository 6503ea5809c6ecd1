//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use fleetlink_core::{AgentConfig, DeviceIdentity, PolicyConfig, RouterConfig};

/// Top-level configuration for the fleetlink daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Per-device agent settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Fleet policy thresholds
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Fleet event topics
    #[serde(default)]
    pub router: RouterConfig,
    /// Simulated plant and telemetry aggregation
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Registry identities, bound to discovered devices in order
    #[serde(default)]
    pub identity: Vec<DeviceIdentity>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Time between two device polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

/// Simulated plant and telemetry aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Machines exposed by the simulated plant
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    /// Time between two production steps, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Production samples per KPI message
    #[serde(default = "default_kpi_window")]
    pub kpi_window: u32,
    /// Window over which fault occurrences are counted, in seconds
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    /// Per-step probability of a random fault on each machine
    #[serde(default = "default_fault_probability")]
    pub fault_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            tick_interval_ms: default_tick_interval_ms(),
            kpi_window: default_kpi_window(),
            error_window_secs: default_error_window_secs(),
            fault_probability: default_fault_probability(),
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

fn default_devices() -> Vec<String> {
    vec!["Device 1".to_string(), "Device 2".to_string()]
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_kpi_window() -> u32 {
    5
}

fn default_error_window_secs() -> u64 {
    60
}

fn default_fault_probability() -> f64 {
    0.02
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control loop cannot run with
    ///
    /// # Errors
    /// Returns error naming the first invalid setting
    pub fn validate(&self) -> eyre::Result<()> {
        if self.daemon.poll_interval_ms == 0 {
            eyre::bail!("daemon.poll_interval_ms must be greater than zero");
        }
        if self.simulation.tick_interval_ms == 0 {
            eyre::bail!("simulation.tick_interval_ms must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.simulation.fault_probability) {
            eyre::bail!(
                "simulation.fault_probability must be between 0 and 1, got {}",
                self.simulation.fault_probability
            );
        }
        Ok(())
    }

    /// Hint for a configuration that cannot bind any discovered device
    #[must_use]
    pub fn identity_hint(&self) -> Option<&'static str> {
        self.identity.is_empty().then_some(
            "no device identities configured, add [[identity]] entries (see fleetlink.example.toml)",
        )
    }

    /// First existing configuration file among the default locations
    #[must_use]
    pub fn locate() -> Option<PathBuf> {
        // Check environment variable
        if let Ok(path) = std::env::var("FLEETLINK_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let mut paths = vec![
            PathBuf::from("fleetlink.toml"),
            PathBuf::from("/etc/fleetlink/fleetlink.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fleetlink/fleetlink.toml"));
        }

        paths.into_iter().find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.daemon.poll_interval(), Duration::from_millis(3000));
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
        assert_eq!(config.agent.command_settle_ms, 500);
        assert_eq!(config.agent.device_pattern, "^Device [0-9]+$");
        assert!((config.policy.kpi_threshold - 90.0).abs() < f64::EPSILON);
        assert_eq!(config.router.kpi_topic, "kpi");
        assert_eq!(config.router.error_topic, "device-errors");
        assert_eq!(config.simulation.error_window(), Duration::from_secs(60));
        assert!(config.identity.is_empty());
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(include_str!("../../../fleetlink.example.toml")).unwrap();
        assert_eq!(config.identity.len(), config.simulation.devices.len());
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[daemon]
log_level = "debug"
log_format = "json"

[policy]
error_threshold = 5

[[identity]]
device_id = "press-1"

[[identity]]
device_id = "press-2"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.policy.error_threshold, 5);
        assert_eq!(config.policy.rate_step, 10);
        assert_eq!(config.identity[1].device_id, "press-2");
    }

    #[test]
    fn test_identity_hint() {
        let hint = Config::default().identity_hint().unwrap();
        assert!(hint.contains("[[identity]]"));
        assert!(hint.contains("fleetlink.example.toml"));

        let config: Config = toml::from_str(include_str!("../../../fleetlink.example.toml")).unwrap();
        assert!(config.identity_hint().is_none());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\npoll_interval_ms = 0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[simulation]\ntick_interval_ms = 0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_fault_probability_out_of_range() {
        let config = Config {
            simulation: SimulationConfig {
                fault_probability: 1.5,
                ..SimulationConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon\nlog_level = 3").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
