//! Telemetry and fleet event payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device-to-cloud telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "PascalCase")]
pub enum TelemetryEvent {
    /// Regular production sample
    Production {
        production_status: i64,
        workorder_id: String,
        temperature: f64,
        good_count: i64,
        bad_count: i64,
        timestamp: DateTime<Utc>,
    },
    /// Fault status transition
    StatusChanged {
        previous: Vec<String>,
        current: Vec<String>,
        newly_set: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

/// KPI queue message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiMessage {
    #[serde(rename = "ConnectionDeviceId")]
    pub device_id: String,
    #[serde(rename = "KPI")]
    pub kpi: f64,
}

/// Error-count queue message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCountMessage {
    #[serde(rename = "ConnectionDeviceId")]
    pub device_id: String,
    #[serde(rename = "sumErrors")]
    pub sum_errors: i64,
}

/// Aggregated per-device signal consumed by the fleet policy
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// Efficiency score in percent
    Kpi { device_id: String, value: f64 },
    /// Fault occurrences in the aggregation window
    ErrorCount { device_id: String, count: i64 },
}

impl FleetEvent {
    /// Registry identity the event refers to
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            FleetEvent::Kpi { device_id, .. } | FleetEvent::ErrorCount { device_id, .. } => {
                device_id
            }
        }
    }
}

impl From<KpiMessage> for FleetEvent {
    fn from(msg: KpiMessage) -> Self {
        FleetEvent::Kpi {
            device_id: msg.device_id,
            value: msg.kpi,
        }
    }
}

impl From<ErrorCountMessage> for FleetEvent {
    fn from(msg: ErrorCountMessage) -> Self {
        FleetEvent::ErrorCount {
            device_id: msg.device_id,
            count: msg.sum_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kpi_message_wire_names() {
        let msg: KpiMessage =
            serde_json::from_str(r#"{"ConnectionDeviceId":"device-1","KPI":87.5}"#).unwrap();
        assert_eq!(msg.device_id, "device-1");
        assert!((msg.kpi - 87.5).abs() < f64::EPSILON);

        let event = FleetEvent::from(msg);
        assert_eq!(event.device_id(), "device-1");
    }

    #[test]
    fn test_error_message_wire_names() {
        let msg: ErrorCountMessage =
            serde_json::from_str(r#"{"ConnectionDeviceId":"device-2","sumErrors":4}"#).unwrap();
        assert_eq!(
            FleetEvent::from(msg),
            FleetEvent::ErrorCount {
                device_id: "device-2".to_string(),
                count: 4
            }
        );
    }

    #[test]
    fn test_telemetry_is_tagged() {
        let event = TelemetryEvent::StatusChanged {
            previous: vec![],
            current: vec!["PowerFailure".to_string()],
            newly_set: vec!["PowerFailure".to_string()],
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "StatusChanged");
        assert_eq!(value["NewlySet"][0], "PowerFailure");
    }
}
