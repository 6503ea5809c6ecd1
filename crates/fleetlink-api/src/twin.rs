//! Device twin property sets

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::StatusBitmask;

/// Properties written by the device agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportedProperties {
    /// Production rate the device currently runs at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_rate: Option<i64>,
    /// Names of the active faults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_status: Option<Vec<String>>,
}

impl ReportedProperties {
    /// Patch carrying only a production rate
    #[must_use]
    pub fn rate(rate: i64) -> Self {
        Self {
            production_rate: Some(rate),
            device_status: None,
        }
    }

    /// Add the fault list for `status` to the patch
    #[must_use]
    pub fn with_status(mut self, status: StatusBitmask) -> Self {
        self.device_status = Some(status.to_names());
        self
    }

    /// Fault status encoded in `DeviceStatus`, unknown names ignored
    #[must_use]
    pub fn status(&self) -> StatusBitmask {
        self.device_status
            .as_deref()
            .map(StatusBitmask::from_names)
            .unwrap_or_default()
    }

    /// Apply a patch; properties absent from `patch` are kept
    pub fn merge(&mut self, patch: &ReportedProperties) {
        if let Some(rate) = patch.production_rate {
            self.production_rate = Some(rate);
        }
        if let Some(ref status) = patch.device_status {
            self.device_status = Some(status.clone());
        }
    }
}

/// Properties written by operators and the fleet policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DesiredProperties {
    /// Target production rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_rate: Option<i64>,
    /// 1 requests an emergency stop, 0 clears the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_trigger: Option<u8>,
}

impl DesiredProperties {
    /// Patch carrying only a production rate target
    #[must_use]
    pub fn rate(rate: i64) -> Self {
        Self {
            production_rate: Some(rate),
            emergency_trigger: None,
        }
    }

    /// Patch carrying only the emergency trigger
    #[must_use]
    pub fn emergency(raised: bool) -> Self {
        Self {
            production_rate: None,
            emergency_trigger: Some(u8::from(raised)),
        }
    }

    /// Whether the patch requests an emergency stop
    #[must_use]
    pub fn emergency_requested(&self) -> bool {
        self.emergency_trigger == Some(1)
    }

    /// Apply a patch; properties absent from `patch` are kept
    pub fn merge(&mut self, patch: &DesiredProperties) {
        if let Some(rate) = patch.production_rate {
            self.production_rate = Some(rate);
        }
        if let Some(trigger) = patch.emergency_trigger {
            self.emergency_trigger = Some(trigger);
        }
    }
}

/// Opaque twin version used for conditional writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(pub u64);

impl VersionTag {
    /// Tag following this one
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Snapshot of a device twin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Twin {
    /// Registry identity of the device
    pub device_id: String,
    /// Device-authored properties
    pub reported: ReportedProperties,
    /// Operator/policy-authored properties
    pub desired: DesiredProperties,
    /// Version at the time of the read
    pub version: VersionTag,
}
