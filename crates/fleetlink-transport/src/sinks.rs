//! Log-backed alerting and telemetry

use async_trait::async_trait;
use tracing::{info, warn};

use fleetlink_api::TelemetryEvent;

use crate::error::{AlertError, TransportError};
use crate::traits::{Alerting, TelemetrySink};

/// Alerting that writes every alert to the log
#[derive(Debug, Clone, Default)]
pub struct LogAlerting;

#[async_trait]
impl Alerting for LogAlerting {
    async fn notify(&self, device_id: &str, message: &str) -> Result<(), AlertError> {
        warn!(twin = %device_id, alert = %message, "device alert");
        Ok(())
    }
}

/// Telemetry sink that writes every event to the log as JSON
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn send(&self, device_id: &str, event: &TelemetryEvent) -> Result<(), TransportError> {
        let body =
            serde_json::to_string(event).map_err(|e| TransportError::IoError(e.to_string()))?;
        info!(twin = %device_id, telemetry = %body, "telemetry sent");
        Ok(())
    }
}
