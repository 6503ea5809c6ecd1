//! Collaborator interfaces the core talks through

use async_trait::async_trait;
use tokio::sync::mpsc;

use fleetlink_api::{
    Attribute, AttributeValue, DesiredProperties, ReportedProperties, TelemetryEvent, Twin,
    VersionTag,
};

use crate::error::{AlertError, RegistryError, StreamError, TransportError};
use crate::types::{CloudNotification, Delivery, OperationAck};

/// Access to machines on the field-bus
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Names of the device nodes visible on the bus
    async fn browse_devices(&self) -> Result<Vec<String>, TransportError>;

    /// Read the production attributes of a device, in poll order
    async fn read_attributes(&self, device: &str) -> Result<Vec<Attribute>, TransportError>;

    /// Write a single attribute
    async fn write_attribute(
        &self,
        device: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), TransportError>;

    /// Invoke `<device>/<operation>`; `None` means the device did not acknowledge
    async fn invoke_operation(
        &self,
        device: &str,
        operation: &str,
    ) -> Result<Option<OperationAck>, TransportError>;

    fn transport_type(&self) -> &'static str;
}

/// Cloud registry holding device twins
#[async_trait]
pub trait ShadowRegistry: Send + Sync {
    /// Current twin, `None` if the device is not registered
    async fn get_twin(&self, device_id: &str) -> Result<Option<Twin>, RegistryError>;

    /// Merge a patch into the reported properties
    async fn update_reported(
        &self,
        device_id: &str,
        patch: &ReportedProperties,
    ) -> Result<(), RegistryError>;

    /// Merge a patch into the desired properties if the twin is still at `version`
    ///
    /// Returns the new version, or [`RegistryError::VersionConflict`].
    async fn update_desired(
        &self,
        device_id: &str,
        patch: &DesiredProperties,
        version: VersionTag,
    ) -> Result<VersionTag, RegistryError>;

    /// Receive desired-property changes, messages and commands for a device
    async fn subscribe(
        &self,
        device_id: &str,
    ) -> Result<mpsc::Receiver<CloudNotification>, RegistryError>;
}

/// Queue-backed stream of fleet messages
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Wait for the next delivery on `topic`; `None` when nothing arrived in time
    async fn receive(&self, topic: &str) -> Result<Option<Delivery>, StreamError>;

    /// Acknowledge and remove a delivery
    async fn complete(&self, delivery: &Delivery) -> Result<(), StreamError>;

    /// Release a delivery for redelivery
    async fn abandon(&self, delivery: &Delivery) -> Result<(), StreamError>;
}

/// Operational alert channel (email, pager, ...)
#[async_trait]
pub trait Alerting: Send + Sync {
    async fn notify(&self, device_id: &str, message: &str) -> Result<(), AlertError>;
}

/// Device-to-cloud telemetry channel
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, device_id: &str, event: &TelemetryEvent) -> Result<(), TransportError>;
}
