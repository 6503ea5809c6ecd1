//! fleetlink-api: Shared data types
//!
//! Twin property sets, fault status flags, device attributes, command and
//! telemetry payloads used by the transport layer, the core and the daemon.

pub mod attributes;
pub mod commands;
pub mod events;
pub mod status;
pub mod twin;

pub use attributes::{Attribute, AttributeValue};
pub use commands::{CloudMessage, CommandRequest, CommandResponse, MessageDisposition};
pub use events::{ErrorCountMessage, FleetEvent, KpiMessage, TelemetryEvent};
pub use status::StatusBitmask;
pub use twin::{DesiredProperties, ReportedProperties, Twin, VersionTag};
