//! Device link factory wiring agents to the in-process collaborators

use std::sync::Arc;

use async_trait::async_trait;
use fleetlink_core::{CoreError, DeviceBinding, DeviceLinkFactory, DeviceLinks};
use fleetlink_transport::{
    Alerting, DeviceTransport, InMemoryRegistry, ShadowRegistry, SimulatedPlant, TelemetrySink,
};

/// Connects every device to the simulated plant and the in-memory registry
pub struct SimulatedLinkFactory {
    plant: Arc<SimulatedPlant>,
    registry: Arc<InMemoryRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    alerting: Arc<dyn Alerting>,
}

impl SimulatedLinkFactory {
    /// Create a new factory instance
    pub fn new(
        plant: Arc<SimulatedPlant>,
        registry: Arc<InMemoryRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        Self {
            plant,
            registry,
            telemetry,
            alerting,
        }
    }
}

#[async_trait]
impl DeviceLinkFactory for SimulatedLinkFactory {
    async fn connect(&self, binding: &DeviceBinding) -> Result<DeviceLinks, CoreError> {
        let devices = self.plant.browse_devices().await?;
        if !devices.contains(&binding.device_name) {
            return Err(CoreError::DeviceNotFound(binding.device_name.clone()));
        }
        if self.registry.get_twin(&binding.twin_id).await?.is_none() {
            return Err(CoreError::ConfigError(format!(
                "device identity {} is not registered",
                binding.twin_id
            )));
        }

        tracing::debug!(
            device = %binding.device_name,
            twin = %binding.twin_id,
            "device links connected"
        );

        Ok(DeviceLinks {
            transport: self.plant.clone(),
            registry: self.registry.clone(),
            telemetry: self.telemetry.clone(),
            alerting: self.alerting.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use fleetlink_transport::{LogAlerting, LogTelemetry};

    use super::*;

    async fn factory() -> SimulatedLinkFactory {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register_device("device-1").await;
        SimulatedLinkFactory::new(
            Arc::new(SimulatedPlant::new(["Device 1"])),
            registry,
            Arc::new(LogTelemetry),
            Arc::new(LogAlerting),
        )
    }

    #[tokio::test]
    async fn test_connect_known_device() {
        let links = factory()
            .await
            .connect(&DeviceBinding::new("Device 1", "device-1"))
            .await
            .unwrap();
        assert_eq!(links.transport.transport_type(), "simulated");
    }

    #[tokio::test]
    async fn test_unknown_machine_or_identity() {
        let factory = factory().await;

        let result = factory
            .connect(&DeviceBinding::new("Device 2", "device-1"))
            .await;
        assert!(matches!(result, Err(CoreError::DeviceNotFound(_))));

        let result = factory
            .connect(&DeviceBinding::new("Device 1", "device-2"))
            .await;
        assert!(matches!(result, Err(CoreError::ConfigError(_))));
    }
}
