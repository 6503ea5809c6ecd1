//! Actor implementations

pub mod agent;
pub mod supervisor;

pub use agent::{DeviceAgent, DeviceAgentArgs};
pub use supervisor::{DeviceLinkFactory, DeviceLinks, FleetSupervisor, FleetSupervisorArgs};
