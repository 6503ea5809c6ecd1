//! Typed view of a device poll

use chrono::Utc;

use fleetlink_api::attributes::names;
use fleetlink_api::{Attribute, AttributeValue, StatusBitmask, TelemetryEvent};

use crate::error::CoreError;

/// Production attributes read from a device in one poll
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionReading {
    pub production_status: i64,
    pub production_rate: i64,
    pub workorder_id: String,
    pub temperature: f64,
    pub good_count: i64,
    pub bad_count: i64,
    /// Raw fault value as reported by the device
    pub device_error: i64,
}

impl ProductionReading {
    /// Interpret an attribute vector, looking attributes up by display name
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedReading`] if an attribute is missing or
    /// has the wrong type
    pub fn from_attributes(attributes: &[Attribute]) -> Result<Self, CoreError> {
        Ok(Self {
            production_status: int(attributes, names::PRODUCTION_STATUS)?,
            production_rate: int(attributes, names::PRODUCTION_RATE)?,
            workorder_id: text(attributes, names::WORKORDER_ID)?,
            temperature: float(attributes, names::TEMPERATURE)?,
            good_count: int(attributes, names::GOOD_COUNT)?,
            bad_count: int(attributes, names::BAD_COUNT)?,
            device_error: int(attributes, names::DEVICE_ERROR)?,
        })
    }

    /// Fault status, bits outside the known set dropped
    #[must_use]
    pub fn status(&self) -> StatusBitmask {
        StatusBitmask::from_raw(self.device_error)
    }

    /// Production telemetry sample for this reading
    #[must_use]
    pub fn to_telemetry(&self) -> TelemetryEvent {
        TelemetryEvent::Production {
            production_status: self.production_status,
            workorder_id: self.workorder_id.clone(),
            temperature: self.temperature,
            good_count: self.good_count,
            bad_count: self.bad_count,
            timestamp: Utc::now(),
        }
    }
}

fn find<'a>(attributes: &'a [Attribute], name: &str) -> Result<&'a AttributeValue, CoreError> {
    attributes
        .iter()
        .find(|a| a.name == name)
        .map(|a| &a.value)
        .ok_or_else(|| CoreError::MalformedReading(format!("missing attribute {name}")))
}

fn int(attributes: &[Attribute], name: &str) -> Result<i64, CoreError> {
    let value = find(attributes, name)?;
    value
        .as_i64()
        .ok_or_else(|| CoreError::MalformedReading(format!("{name}: expected integer, got {value}")))
}

fn float(attributes: &[Attribute], name: &str) -> Result<f64, CoreError> {
    let value = find(attributes, name)?;
    value
        .as_f64()
        .ok_or_else(|| CoreError::MalformedReading(format!("{name}: expected number, got {value}")))
}

fn text(attributes: &[Attribute], name: &str) -> Result<String, CoreError> {
    let value = find(attributes, name)?;
    // Workorder ids may be exposed as numbers by some servers
    Ok(value.as_str().map_or_else(|| value.to_string(), str::to_string))
}
