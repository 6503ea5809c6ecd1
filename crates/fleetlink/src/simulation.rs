//! Simulated plant driver and telemetry aggregation
//!
//! Stands in for the cloud-side stream analytics: production samples are
//! folded into a KPI per device and newly set faults into an error count,
//! both published on the fleet event stream the router consumes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use fleetlink_api::{ErrorCountMessage, KpiMessage, TelemetryEvent};
use fleetlink_core::RouterConfig;
use fleetlink_transport::{InMemoryStream, SimulatedPlant, TelemetrySink, TransportError};

use crate::config::SimulationConfig;

/// Advance the plant every `interval` until shutdown
pub async fn run_plant(
    plant: Arc<SimulatedPlant>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => plant.tick().await,
        }
    }
    info!("plant simulation stopped");
}

#[derive(Default)]
struct DeviceWindow {
    samples: u32,
    good: i64,
    bad: i64,
    last_counts: Option<(i64, i64)>,
    faults: VecDeque<Instant>,
}

impl DeviceWindow {
    /// Count increase since the previous sample; a drop means a new workorder
    fn delta(current: i64, previous: i64) -> i64 {
        if current >= previous {
            current - previous
        } else {
            current
        }
    }

    fn add_sample(&mut self, good: i64, bad: i64) {
        let (prev_good, prev_bad) = self.last_counts.unwrap_or((0, 0));
        self.good += Self::delta(good, prev_good);
        self.bad += Self::delta(bad, prev_bad);
        self.last_counts = Some((good, bad));
        self.samples += 1;
    }

    /// KPI over the closed window, `None` if nothing was produced
    fn close_window(&mut self) -> Option<f64> {
        let total = self.good + self.bad;
        #[allow(clippy::cast_precision_loss)]
        let kpi = (total > 0).then(|| self.good as f64 / total as f64 * 100.0);
        self.samples = 0;
        self.good = 0;
        self.bad = 0;
        kpi
    }

    fn add_faults(&mut self, count: usize, now: Instant, window: Duration) -> usize {
        self.faults.extend(std::iter::repeat_n(now, count));
        while self
            .faults
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.faults.pop_front();
        }
        self.faults.len()
    }
}

/// Telemetry sink publishing KPI and error-count messages
pub struct FleetAggregator {
    stream: Arc<InMemoryStream>,
    /// Receives every event as well
    inner: Arc<dyn TelemetrySink>,
    kpi_topic: String,
    error_topic: String,
    kpi_window: u32,
    error_window: Duration,
    windows: Mutex<HashMap<String, DeviceWindow>>,
}

impl FleetAggregator {
    pub fn new(
        stream: Arc<InMemoryStream>,
        inner: Arc<dyn TelemetrySink>,
        router: &RouterConfig,
        simulation: &SimulationConfig,
    ) -> Self {
        Self {
            stream,
            inner,
            kpi_topic: router.kpi_topic.clone(),
            error_topic: router.error_topic.clone(),
            kpi_window: simulation.kpi_window.max(1),
            error_window: simulation.error_window(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    async fn publish<T: serde::Serialize>(&self, topic: &str, body: &T) -> Result<(), TransportError> {
        let body = serde_json::to_string(body).map_err(|e| TransportError::IoError(e.to_string()))?;
        self.stream.publish(topic, body).await;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for FleetAggregator {
    async fn send(&self, device_id: &str, event: &TelemetryEvent) -> Result<(), TransportError> {
        self.inner.send(device_id, event).await?;

        match event {
            TelemetryEvent::Production {
                good_count,
                bad_count,
                ..
            } => {
                let kpi = {
                    let mut windows = self.windows.lock().await;
                    let window = windows.entry(device_id.to_string()).or_default();
                    window.add_sample(*good_count, *bad_count);
                    if window.samples < self.kpi_window {
                        return Ok(());
                    }
                    window.close_window()
                };

                if let Some(kpi) = kpi {
                    debug!(twin = %device_id, kpi, "kpi window closed");
                    self.publish(
                        &self.kpi_topic,
                        &KpiMessage {
                            device_id: device_id.to_string(),
                            kpi,
                        },
                    )
                    .await?;
                }
            }
            TelemetryEvent::StatusChanged { newly_set, .. } => {
                if newly_set.is_empty() {
                    return Ok(());
                }

                let count = {
                    let mut windows = self.windows.lock().await;
                    windows.entry(device_id.to_string()).or_default().add_faults(
                        newly_set.len(),
                        Instant::now(),
                        self.error_window,
                    )
                };

                debug!(twin = %device_id, count, "device errors counted");
                self.publish(
                    &self.error_topic,
                    &ErrorCountMessage {
                        device_id: device_id.to_string(),
                        sum_errors: i64::try_from(count).unwrap_or(i64::MAX),
                    },
                )
                .await?;
            }
        }

        Ok(())
    }
}
