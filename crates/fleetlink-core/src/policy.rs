//! Fleet policy: turns aggregated fleet events into desired-property writes

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetlink_api::{DesiredProperties, FleetEvent, Twin};
use fleetlink_transport::{RegistryError, ShadowRegistry};

use crate::config::PolicyConfig;
use crate::error::CoreError;

/// Read-modify-write attempts before a conflicting decision is skipped
const MAX_ATTEMPTS: usize = 2;

/// Why a policy evaluation wrote nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoChangeReason {
    /// KPI at or above the threshold
    KpiHealthy,
    /// Twin not registered
    TwinMissing,
    /// Twin has no reported production rate yet
    RateUnknown,
    /// Reported rate below the minimum for a reduction
    RateAtFloor,
}

impl fmt::Display for NoChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoChangeReason::KpiHealthy => write!(f, "kpi healthy"),
            NoChangeReason::TwinMissing => write!(f, "twin missing"),
            NoChangeReason::RateUnknown => write!(f, "reported rate unknown"),
            NoChangeReason::RateAtFloor => write!(f, "rate at floor"),
        }
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Desired production rate lowered
    Throttled { from: i64, to: i64 },
    /// Emergency trigger written
    TriggerSet { trigger: u8 },
    /// Nothing written
    NoChange(NoChangeReason),
    /// Twin kept changing underneath the write
    Skipped,
}

enum Plan {
    Write(DesiredProperties, PolicyDecision),
    Done(PolicyDecision),
}

/// Evaluates fleet events against the twin registry
pub struct FleetPolicyEngine {
    registry: Arc<dyn ShadowRegistry>,
    config: PolicyConfig,
}

impl FleetPolicyEngine {
    pub fn new(registry: Arc<dyn ShadowRegistry>, config: PolicyConfig) -> Self {
        Self { registry, config }
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate any fleet event
    ///
    /// # Errors
    /// Propagates registry failures other than version conflicts
    pub async fn on_event(&self, event: &FleetEvent) -> Result<PolicyDecision, CoreError> {
        match event {
            FleetEvent::Kpi { device_id, value } => self.on_kpi_event(device_id, *value).await,
            FleetEvent::ErrorCount { device_id, count } => {
                self.on_error_event(device_id, *count).await
            }
        }
    }

    /// Lower the desired rate by one step when the KPI is below the threshold
    ///
    /// The step is taken from the last reported rate, so repeated events
    /// before the device re-reports all target the same value.
    ///
    /// # Errors
    /// Propagates registry failures other than version conflicts
    pub async fn on_kpi_event(
        &self,
        device_id: &str,
        kpi: f64,
    ) -> Result<PolicyDecision, CoreError> {
        if kpi >= self.config.kpi_threshold {
            debug!(twin = %device_id, kpi, "kpi above threshold");
            return Ok(PolicyDecision::NoChange(NoChangeReason::KpiHealthy));
        }

        let step = self.config.rate_step;
        let floor = self.config.min_rate_for_step;
        let decision = self
            .apply(device_id, |twin| {
                let Some(twin) = twin else {
                    warn!(twin = %device_id, kpi, "kpi event for unknown twin");
                    return Plan::Done(PolicyDecision::NoChange(NoChangeReason::TwinMissing));
                };
                let Some(reported) = twin.reported.production_rate else {
                    warn!(twin = %device_id, kpi, "kpi event before any reported rate");
                    return Plan::Done(PolicyDecision::NoChange(NoChangeReason::RateUnknown));
                };
                if reported < floor {
                    return Plan::Done(PolicyDecision::NoChange(NoChangeReason::RateAtFloor));
                }
                let target = reported - step;
                Plan::Write(
                    DesiredProperties::rate(target),
                    PolicyDecision::Throttled {
                        from: reported,
                        to: target,
                    },
                )
            })
            .await?;

        info!(twin = %device_id, kpi, decision = ?decision, "kpi policy evaluated");
        Ok(decision)
    }

    /// Write the emergency trigger from the error count; always writes
    ///
    /// # Errors
    /// Propagates registry failures other than version conflicts
    pub async fn on_error_event(
        &self,
        device_id: &str,
        count: i64,
    ) -> Result<PolicyDecision, CoreError> {
        let raised = count >= self.config.error_threshold;
        let decision = self
            .apply(device_id, |twin| {
                if twin.is_none() {
                    warn!(twin = %device_id, count, "error event for unknown twin");
                    return Plan::Done(PolicyDecision::NoChange(NoChangeReason::TwinMissing));
                }
                Plan::Write(
                    DesiredProperties::emergency(raised),
                    PolicyDecision::TriggerSet {
                        trigger: u8::from(raised),
                    },
                )
            })
            .await?;

        info!(twin = %device_id, count, decision = ?decision, "error policy evaluated");
        Ok(decision)
    }

    /// Optimistic read-modify-write, retried once on a version conflict
    async fn apply<F>(&self, device_id: &str, plan: F) -> Result<PolicyDecision, CoreError>
    where
        F: Fn(Option<&Twin>) -> Plan,
    {
        for attempt in 1..=MAX_ATTEMPTS {
            let twin = self.registry.get_twin(device_id).await?;
            let (patch, decision) = match plan(twin.as_ref()) {
                Plan::Done(decision) => return Ok(decision),
                Plan::Write(patch, decision) => (patch, decision),
            };
            // Plan::Write is only produced for an existing twin
            let Some(version) = twin.map(|t| t.version) else {
                return Ok(PolicyDecision::NoChange(NoChangeReason::TwinMissing));
            };

            match self
                .registry
                .update_desired(device_id, &patch, version)
                .await
            {
                Ok(_) => return Ok(decision),
                Err(e @ RegistryError::VersionConflict { .. }) => {
                    warn!(twin = %device_id, attempt, error = %e, "desired write conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(twin = %device_id, "desired write skipped after repeated conflicts");
        Ok(PolicyDecision::Skipped)
    }
}
