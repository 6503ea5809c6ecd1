//! Message types for actor communication
//!
//! Message handlers are implemented in their respective actor modules.

use chrono::{DateTime, Utc};
use kameo_macros::Reply;

use fleetlink_api::{Attribute, DesiredProperties, StatusBitmask};

use crate::config::DeviceBinding;
use crate::reading::ProductionReading;

// ============================================================================
// DeviceAgent Messages
// ============================================================================

/// Subscribe to cloud notifications and seed the status cache from the twin
#[derive(Debug)]
pub struct Initialize;

/// Read the device and reconcile the reading
#[derive(Debug)]
pub struct Poll;

/// Reconcile a freshly polled attribute vector
#[derive(Debug)]
pub struct HandleReading {
    pub attributes: Vec<Attribute>,
}

/// Emit a production telemetry sample in the background
#[derive(Debug)]
pub struct SendTelemetry {
    pub reading: ProductionReading,
}

/// Apply a desired-property patch pushed by the registry
#[derive(Debug)]
pub struct DesiredPropertiesChanged {
    /// Changed properties only
    pub desired: DesiredProperties,
}

/// Wait for outstanding alerts and telemetry
#[derive(Debug)]
pub struct Flush;

/// Stop the notification pump and drain background jobs
#[derive(Debug)]
pub struct Shutdown;

/// Get the agent's current view of its device
#[derive(Debug)]
pub struct GetAgentStatus;

/// Result of reconciling one reading
#[derive(Debug, Clone, PartialEq, Eq, Reply)]
pub struct ReadingOutcome {
    /// Node name on the field-bus
    pub device_name: String,
    /// Cached status before the reading
    pub previous: StatusBitmask,
    /// Status carried by the reading
    pub current: StatusBitmask,
    /// Faults set now that were clear before
    pub newly_set: StatusBitmask,
    /// Production rate published to the twin
    pub production_rate: i64,
}

impl ReadingOutcome {
    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.previous != self.current
    }

    #[must_use]
    pub fn alerted(&self) -> bool {
        !self.newly_set.is_empty()
    }
}

/// Agent status response
#[derive(Debug, Clone, PartialEq, Eq, Reply)]
pub struct AgentStatus {
    /// Node name on the field-bus
    pub device_name: String,
    /// Twin identity in the registry
    pub twin_id: String,
    /// Last known fault status
    pub status: StatusBitmask,
    /// Last production rate published to the twin
    pub last_rate: Option<i64>,
    /// Whether subscriptions are active
    pub initialized: bool,
    /// Successful polls since start
    pub polls: u64,
    /// Time of the last successful poll
    pub last_polled: Option<DateTime<Utc>>,
}

// ============================================================================
// FleetSupervisor Messages
// ============================================================================

/// Spawn and initialize an agent for a discovered device
#[derive(Debug)]
pub struct RegisterDevice {
    pub binding: DeviceBinding,
}

/// Poll the next device in registration order
#[derive(Debug)]
pub struct PollNext;

/// Poll a specific device
#[derive(Debug)]
pub struct PollDevice {
    pub device_name: String,
}

/// List all managed devices
#[derive(Debug)]
pub struct ListDevices;

/// Get status of a specific device
#[derive(Debug)]
pub struct GetDeviceStatus {
    pub device_name: String,
}

/// Flush every agent
#[derive(Debug)]
pub struct FlushAll;

/// Shut every agent down
#[derive(Debug)]
pub struct ShutdownAll;
