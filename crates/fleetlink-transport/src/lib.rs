//! fleetlink-transport: Collaborator interfaces
//!
//! Traits for the field-bus, twin registry, fleet event stream, alerting and
//! telemetry, plus in-memory implementations of each.

pub mod error;
pub mod plant;
pub mod registry;
pub mod sinks;
pub mod stream;
pub mod traits;
pub mod types;

pub use error::{AlertError, RegistryError, StreamError, TransportError};
pub use plant::{MachineState, SimulatedPlant};
pub use registry::InMemoryRegistry;
pub use sinks::{LogAlerting, LogTelemetry};
pub use stream::InMemoryStream;
pub use traits::{Alerting, DeviceTransport, EventStream, ShadowRegistry, TelemetrySink};
pub use types::{CloudNotification, Delivery, OperationAck};
