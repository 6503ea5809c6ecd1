//! fleetlink-core: Twin synchronization and fleet control
//!
//! Implements the `DeviceAgent` and `FleetSupervisor` using kameo framework,
//! plus the command dispatcher, the fleet policy engine and the event router.

pub mod actor;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod policy;
pub mod polling;
pub mod reading;
pub mod router;

pub use actor::agent::{DeviceAgent, DeviceAgentArgs};
pub use actor::supervisor::{
    DeviceLinkFactory, DeviceLinks, FleetSupervisor, FleetSupervisorArgs,
};
pub use config::{AgentConfig, DeviceBinding, DeviceIdentity, PolicyConfig, RouterConfig};
pub use discovery::{device_pattern, select_devices};
pub use dispatch::{CommandDispatcher, CommandHandler, DeviceOperation, RouteMatch, UnknownCommand};
pub use error::CoreError;
pub use message::{
    AgentStatus, DesiredPropertiesChanged, Flush, FlushAll, GetAgentStatus, GetDeviceStatus,
    HandleReading, Initialize, ListDevices, Poll, PollDevice, PollNext, ReadingOutcome,
    RegisterDevice, SendTelemetry, Shutdown, ShutdownAll,
};
pub use policy::{FleetPolicyEngine, NoChangeReason, PolicyDecision};
pub use polling::{DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL, PollingLoop};
pub use reading::ProductionReading;
pub use router::{
    ErrorCountHandler, EventRouter, FaultSource, FleetHandler, KpiHandler, Processed, RouterFault,
};
