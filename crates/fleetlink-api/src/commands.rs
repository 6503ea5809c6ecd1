//! Remote command and cloud-to-device message types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Device operations reachable as remote commands
pub mod operations {
    /// Stop production and raise the emergency fault
    pub const EMERGENCY_STOP: &str = "EmergencyStop";
    /// Clear every active fault
    pub const RESET_ERROR_STATUS: &str = "ResetErrorStatus";
}

/// Named command invoked on a device from the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command name, e.g. `EmergencyStop`
    pub name: String,
    /// Optional JSON payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandRequest {
    /// Command without payload
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }
}

/// Response returned to the cloud for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Protocol status code
    pub status: i32,
}

impl CommandResponse {
    /// Status code for an accepted command
    pub const ACCEPTED: i32 = 0;

    /// Generic accepted response
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            status: Self::ACCEPTED,
        }
    }

    /// Whether the command was accepted
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status == Self::ACCEPTED
    }
}

/// Message sent from the cloud to a single device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudMessage {
    /// Message identifier
    pub id: String,
    /// Raw body
    pub body: String,
    /// Application properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Outcome a device reports for a cloud-to-device message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDisposition {
    /// Processed, remove from the device queue
    Completed,
    /// Not processed, make it available again
    Abandoned,
}
