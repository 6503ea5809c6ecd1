//! Configuration types for agents, policy and routing

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetlink_api::commands::operations::{EMERGENCY_STOP, RESET_ERROR_STATUS};

/// Registry identity available for a discovered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Twin identity in the registry
    pub device_id: String,
}

/// A discovered device bound to its registry identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Node name on the field-bus
    pub device_name: String,
    /// Twin identity in the registry
    pub twin_id: String,
}

impl DeviceBinding {
    pub fn new(device_name: impl Into<String>, twin_id: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            twin_id: twin_id.into(),
        }
    }
}

/// Per-device agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Delay before a command response is returned, in milliseconds
    #[serde(default = "default_command_settle_ms")]
    pub command_settle_ms: u64,
    /// Commands forwarded to device operations of the same name
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
    /// Pattern a browsed node name must match to be managed
    #[serde(default = "default_device_pattern")]
    pub device_pattern: String,
}

fn default_command_settle_ms() -> u64 {
    500
}

fn default_commands() -> Vec<String> {
    vec![EMERGENCY_STOP.to_string(), RESET_ERROR_STATUS.to_string()]
}

fn default_device_pattern() -> String {
    "^Device [0-9]+$".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command_settle_ms: default_command_settle_ms(),
            commands: default_commands(),
            device_pattern: default_device_pattern(),
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }
}

/// Thresholds of the fleet policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// KPI below this value throttles production
    #[serde(default = "default_kpi_threshold")]
    pub kpi_threshold: f64,
    /// Production rate reduction per throttling decision
    #[serde(default = "default_rate_step")]
    pub rate_step: i64,
    /// Reported rate below which no further reduction is applied
    #[serde(default = "default_min_rate_for_step")]
    pub min_rate_for_step: i64,
    /// Error count at which the emergency trigger is raised
    #[serde(default = "default_error_threshold")]
    pub error_threshold: i64,
}

fn default_kpi_threshold() -> f64 {
    90.0
}

fn default_rate_step() -> i64 {
    10
}

fn default_min_rate_for_step() -> i64 {
    10
}

fn default_error_threshold() -> i64 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kpi_threshold: default_kpi_threshold(),
            rate_step: default_rate_step(),
            min_rate_for_step: default_min_rate_for_step(),
            error_threshold: default_error_threshold(),
        }
    }
}

/// Topic names of the fleet event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Topic carrying KPI messages
    #[serde(default = "default_kpi_topic")]
    pub kpi_topic: String,
    /// Topic carrying error-count messages
    #[serde(default = "default_error_topic")]
    pub error_topic: String,
    /// How long a receive waits for a message, in milliseconds
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
}

fn default_kpi_topic() -> String {
    "kpi".to_string()
}

fn default_error_topic() -> String {
    "device-errors".to_string()
}

fn default_receive_wait_ms() -> u64 {
    1000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            kpi_topic: default_kpi_topic(),
            error_topic: default_error_topic(),
            receive_wait_ms: default_receive_wait_ms(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }
}
