//! Fixed-interval polling of the fleet

use std::time::Duration;

use kameo::actor::ActorRef;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actor::supervisor::FleetSupervisor;
use crate::error::CoreError;
use crate::message::PollNext;

/// Default time between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Shortest accepted time between two polls
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Asks the supervisor to poll the next device on every tick
pub struct PollingLoop {
    supervisor: ActorRef<FleetSupervisor>,
    interval: Duration,
}

impl PollingLoop {
    /// Intervals shorter than [`MIN_POLL_INTERVAL`] are raised to it
    pub fn new(supervisor: ActorRef<FleetSupervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Poll until `shutdown` turns true; a poll in progress completes first
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis(), "polling loop started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.supervisor.ask(PollNext).await {
                Ok(outcome) => debug!(
                    device = %outcome.device_name,
                    status = %outcome.current,
                    rate = outcome.production_rate,
                    "device polled"
                ),
                Err(kameo::error::SendError::HandlerError(CoreError::NoDevices)) => {
                    debug!("no devices to poll");
                }
                Err(kameo::error::SendError::HandlerError(e)) if e.is_transient() => {
                    warn!(error = %e, "poll failed, retrying next cycle");
                }
                Err(e) => error!(error = %e, "poll failed"),
            }
        }

        info!("polling loop stopped");
    }
}
