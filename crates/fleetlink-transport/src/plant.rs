//! Simulated production plant
//!
//! In-process stand-in for a field-bus server exposing production machines.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use fleetlink_api::attributes::names;
use fleetlink_api::commands::operations::{EMERGENCY_STOP, RESET_ERROR_STATUS};
use fleetlink_api::{Attribute, AttributeValue, StatusBitmask};

use crate::error::TransportError;
use crate::traits::DeviceTransport;
use crate::types::OperationAck;

const DEFAULT_RATE: i64 = 100;
const BASE_TEMPERATURE: f64 = 60.0;

/// State of a single simulated machine
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    pub production_status: i64,
    pub production_rate: i64,
    pub workorder_id: String,
    pub temperature: f64,
    pub good_count: i64,
    pub bad_count: i64,
    pub device_error: i64,
}

impl MachineState {
    fn running() -> Self {
        Self {
            production_status: 1,
            production_rate: DEFAULT_RATE,
            workorder_id: uuid::Uuid::new_v4().to_string(),
            temperature: BASE_TEMPERATURE,
            good_count: 0,
            bad_count: 0,
            device_error: 0,
        }
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::new(names::PRODUCTION_STATUS, self.production_status),
            Attribute::new(names::PRODUCTION_RATE, self.production_rate),
            Attribute::new(names::WORKORDER_ID, self.workorder_id.as_str()),
            Attribute::new(names::TEMPERATURE, self.temperature),
            Attribute::new(names::GOOD_COUNT, self.good_count),
            Attribute::new(names::BAD_COUNT, self.bad_count),
            Attribute::new(names::DEVICE_ERROR, self.device_error),
        ]
    }

    fn advance(&mut self, rng: &mut impl Rng, fault_probability: f64) {
        if self.production_status == 0 {
            if self.device_error == 0 {
                // Faults cleared, start a new workorder
                self.production_status = 1;
                self.workorder_id = uuid::Uuid::new_v4().to_string();
                self.good_count = 0;
                self.bad_count = 0;
            }
            self.temperature += (BASE_TEMPERATURE - self.temperature) * 0.2;
            return;
        }

        // Faster lines scrap more parts
        let produced = (self.production_rate / 10).max(1);
        #[allow(clippy::cast_precision_loss)]
        let scrap_ratio = rng.gen_range(0.0..0.08) + self.production_rate as f64 / 1000.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let bad = ((produced as f64 * scrap_ratio).round() as i64).min(produced);
        self.bad_count += bad;
        self.good_count += produced - bad;
        self.temperature = (self.temperature + rng.gen_range(-1.5..1.5)).clamp(20.0, 120.0);

        if rng.gen_bool(fault_probability.clamp(0.0, 1.0)) {
            let fault = 1_i64 << rng.gen_range(0..4);
            self.device_error |= fault;
            if self.device_error & i64::from(StatusBitmask::EMERGENCY_STOP.bits()) != 0 {
                self.production_status = 0;
            }
        }
    }
}

/// In-memory plant implementing [`DeviceTransport`]
#[derive(Debug)]
pub struct SimulatedPlant {
    machines: RwLock<BTreeMap<String, MachineState>>,
    fault_probability: f64,
}

impl SimulatedPlant {
    /// Create a plant with one running machine per name
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let machines = names
            .into_iter()
            .map(|name| (name.into(), MachineState::running()))
            .collect();
        Self {
            machines: RwLock::new(machines),
            fault_probability: 0.0,
        }
    }

    /// Set the per-tick probability of a random fault on each machine
    #[must_use]
    pub fn with_fault_probability(mut self, probability: f64) -> Self {
        self.fault_probability = probability;
        self
    }

    /// Snapshot of a machine's state
    pub async fn machine(&self, device: &str) -> Option<MachineState> {
        self.machines.read().await.get(device).cloned()
    }

    /// Overwrite the raw fault value of a machine
    ///
    /// # Errors
    /// Returns error if the device does not exist
    pub async fn set_device_error(&self, device: &str, raw: i64) -> Result<(), TransportError> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(device)
            .ok_or_else(|| TransportError::DeviceNotFound(device.to_string()))?;
        machine.device_error = raw;
        Ok(())
    }

    /// Advance every machine by one production step
    pub async fn tick(&self) {
        let mut machines = self.machines.write().await;
        let mut rng = rand::thread_rng();
        for (name, machine) in machines.iter_mut() {
            let before = machine.device_error;
            machine.advance(&mut rng, self.fault_probability);
            if machine.device_error != before {
                warn!(
                    device = %name,
                    status = %StatusBitmask::from_raw(machine.device_error),
                    "simulated fault injected"
                );
            }
        }
    }
}

#[async_trait]
impl DeviceTransport for SimulatedPlant {
    async fn browse_devices(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.machines.read().await.keys().cloned().collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_attributes(&self, device: &str) -> Result<Vec<Attribute>, TransportError> {
        self.machines
            .read()
            .await
            .get(device)
            .map(MachineState::attributes)
            .ok_or_else(|| TransportError::DeviceNotFound(device.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn write_attribute(
        &self,
        device: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), TransportError> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(device)
            .ok_or_else(|| TransportError::DeviceNotFound(device.to_string()))?;

        if attribute != names::PRODUCTION_RATE {
            return Err(TransportError::WriteRejected {
                attribute: attribute.to_string(),
                reason: "attribute is read-only".to_string(),
            });
        }

        let rate = value
            .as_i64()
            .filter(|rate| *rate >= 0)
            .ok_or_else(|| TransportError::WriteRejected {
                attribute: attribute.to_string(),
                reason: format!("invalid production rate {value}"),
            })?;

        debug!(device = %device, rate, "production rate written");
        machine.production_rate = rate;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn invoke_operation(
        &self,
        device: &str,
        operation: &str,
    ) -> Result<Option<OperationAck>, TransportError> {
        let mut machines = self.machines.write().await;
        let machine = machines
            .get_mut(device)
            .ok_or_else(|| TransportError::DeviceNotFound(device.to_string()))?;

        match operation {
            EMERGENCY_STOP => {
                machine.production_status = 0;
                machine.device_error |= i64::from(StatusBitmask::EMERGENCY_STOP.bits());
            }
            RESET_ERROR_STATUS => {
                machine.device_error = 0;
            }
            _ => {
                debug!(device = %device, operation = %operation, "no such operation");
                return Ok(None);
            }
        }

        info!(device = %device, operation = %operation, "operation executed");
        Ok(Some(OperationAck::default()))
    }

    fn transport_type(&self) -> &'static str {
        "simulated"
    }
}
