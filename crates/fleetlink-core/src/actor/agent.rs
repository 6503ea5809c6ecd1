//! `DeviceAgent`: Per-device twin synchronization
//!
//! Keeps the reported side of a device twin consistent with the device,
//! applies desired-property changes to the device and serves remote commands.
//! The actor mailbox is the only way to reach `status_cache`, so computing a
//! status diff, updating the cache and publishing it never interleave.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use fleetlink_api::attributes::names;
use fleetlink_api::commands::operations::EMERGENCY_STOP;
use fleetlink_api::{AttributeValue, ReportedProperties, StatusBitmask, TelemetryEvent};
use fleetlink_transport::{
    Alerting, CloudNotification, DeviceTransport, ShadowRegistry, TelemetrySink,
};

use crate::config::{AgentConfig, DeviceBinding};
use crate::dispatch::CommandDispatcher;
use crate::error::CoreError;
use crate::message::{
    AgentStatus, DesiredPropertiesChanged, Flush, GetAgentStatus, HandleReading, Initialize, Poll,
    ReadingOutcome, SendTelemetry, Shutdown,
};
use crate::reading::ProductionReading;

/// Arguments for spawning a `DeviceAgent`
pub struct DeviceAgentArgs {
    /// Device node and twin identity
    pub binding: DeviceBinding,
    /// Field-bus connection
    pub transport: Arc<dyn DeviceTransport>,
    /// Twin registry connection
    pub registry: Arc<dyn ShadowRegistry>,
    /// Device-to-cloud telemetry
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Operational alerts
    pub alerting: Arc<dyn Alerting>,
    /// Agent settings
    pub config: AgentConfig,
}

/// Per-device actor owning the device connection and its status cache
pub struct DeviceAgent {
    binding: DeviceBinding,
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<dyn ShadowRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    alerting: Arc<dyn Alerting>,
    dispatcher: Arc<CommandDispatcher>,
    /// Last known fault status, used only to detect transitions
    status_cache: StatusBitmask,
    /// Status changed but not yet published
    pending_status: bool,
    last_rate: Option<i64>,
    initialized: bool,
    polls: u64,
    last_polled: Option<DateTime<Utc>>,
    /// Alerts and telemetry still being delivered
    jobs: JoinSet<()>,
    myself: WeakActorRef<Self>,
    shutdown_tx: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
}

impl DeviceAgent {
    /// Node name on the field-bus
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.binding.device_name
    }

    /// Twin identity in the registry
    #[must_use]
    pub fn twin_id(&self) -> &str {
        &self.binding.twin_id
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            device_name: self.binding.device_name.clone(),
            twin_id: self.binding.twin_id.clone(),
            status: self.status_cache,
            last_rate: self.last_rate,
            initialized: self.initialized,
            polls: self.polls,
            last_polled: self.last_polled,
        }
    }

    /// Status stored in the twin, or nominal if it cannot be read
    async fn seed_status(&self) -> StatusBitmask {
        match self.registry.get_twin(self.twin_id()).await {
            Ok(Some(twin)) => twin.reported.status(),
            Ok(None) => {
                warn!(twin = %self.twin_id(), "twin not found, starting from nominal status");
                StatusBitmask::empty()
            }
            Err(e) => {
                warn!(
                    twin = %self.twin_id(),
                    error = %e,
                    "cannot read twin, starting from nominal status"
                );
                StatusBitmask::empty()
            }
        }
    }

    /// Diff a reading against the cache and publish the reported properties
    async fn reconcile(&mut self, reading: &ProductionReading) -> Result<ReadingOutcome, CoreError> {
        if StatusBitmask::has_foreign_bits(reading.device_error) {
            warn!(
                device = %self.device_name(),
                raw = reading.device_error,
                "device error carries unknown bits, ignoring them"
            );
        }

        let previous = self.status_cache;
        let current = reading.status();
        let newly_set = current.newly_set(previous);
        let rate = reading.production_rate;

        if current != previous {
            info!(
                device = %self.device_name(),
                from = %previous,
                to = %current,
                "device status changed"
            );
            if !newly_set.is_empty() {
                self.spawn_alert(newly_set);
            }
            self.spawn_telemetry(TelemetryEvent::StatusChanged {
                previous: previous.to_names(),
                current: current.to_names(),
                newly_set: newly_set.to_names(),
                timestamp: Utc::now(),
            });
            self.status_cache = current;
            self.pending_status = true;
        }

        let mut patch = ReportedProperties::rate(rate);
        if self.pending_status {
            patch = patch.with_status(current);
        }

        if let Err(e) = self.registry.update_reported(self.twin_id(), &patch).await {
            warn!(twin = %self.twin_id(), error = %e, "failed to publish reported properties");
            return Err(e.into());
        }
        self.pending_status = false;
        self.last_rate = Some(rate);

        Ok(ReadingOutcome {
            device_name: self.binding.device_name.clone(),
            previous,
            current,
            newly_set,
            production_rate: rate,
        })
    }

    fn spawn_alert(&mut self, newly_set: StatusBitmask) {
        let alerting = self.alerting.clone();
        let twin = self.binding.twin_id.clone();
        let message = format!(
            "{} reported new errors: {}",
            self.binding.device_name,
            newly_set.fault_names().join(", ")
        );
        self.reap_jobs();
        self.jobs.spawn(async move {
            if let Err(e) = alerting.notify(&twin, &message).await {
                warn!(twin = %twin, error = %e, "alert delivery failed");
            }
        });
    }

    fn spawn_telemetry(&mut self, event: TelemetryEvent) {
        let telemetry = self.telemetry.clone();
        let twin = self.binding.twin_id.clone();
        self.reap_jobs();
        self.jobs.spawn(async move {
            if let Err(e) = telemetry.send(&twin, &event).await {
                warn!(twin = %twin, error = %e, "telemetry delivery failed");
            }
        });
    }

    fn reap_jobs(&mut self) {
        while let Some(finished) = self.jobs.try_join_next() {
            if let Err(e) = finished {
                error!(device = %self.binding.device_name, error = %e, "background job panicked");
            }
        }
    }

    async fn drain_jobs(&mut self) {
        while let Some(finished) = self.jobs.join_next().await {
            if let Err(e) = finished {
                error!(device = %self.binding.device_name, error = %e, "background job panicked");
            }
        }
    }

    /// Stop the notification pump, letting commands in progress finish
    async fn stop_pump(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(pump) = self.pump.take()
            && let Err(e) = pump.await
        {
            error!(device = %self.binding.device_name, error = %e, "notification pump panicked");
        }
        self.initialized = false;
    }
}

impl Actor for DeviceAgent {
    type Args = DeviceAgentArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            device = %args.binding.device_name,
            twin = %args.binding.twin_id,
            transport = args.transport.transport_type(),
            id = %actor_ref.id(),
            "DeviceAgent starting"
        );

        let dispatcher = Arc::new(CommandDispatcher::for_device(
            &args.binding,
            args.transport.clone(),
            &args.config,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            binding: args.binding,
            transport: args.transport,
            registry: args.registry,
            telemetry: args.telemetry,
            alerting: args.alerting,
            dispatcher,
            status_cache: StatusBitmask::empty(),
            pending_status: false,
            last_rate: None,
            initialized: false,
            polls: 0,
            last_polled: None,
            jobs: JoinSet::new(),
            myself: actor_ref.downgrade(),
            shutdown_tx,
            pump: None,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(
            device = %self.binding.device_name,
            reason = ?reason,
            "DeviceAgent stopping"
        );

        self.stop_pump().await;
        self.drain_jobs().await;
        Ok(())
    }
}

/// Serve cloud notifications until shutdown
///
/// Desired changes go through the agent's mailbox. Commands and messages are
/// answered here so the settle delay never holds up the mailbox.
async fn notification_pump(
    device: String,
    mut notifications: mpsc::Receiver<CloudNotification>,
    dispatcher: Arc<CommandDispatcher>,
    agent: WeakActorRef<DeviceAgent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut served = JoinSet::new();

    loop {
        let notification = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => {
                    warn!(device = %device, "notification stream closed");
                    break;
                }
            },
        };

        match notification {
            CloudNotification::DesiredChanged(desired) => {
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                debug!(device = %device, desired = ?desired, "desired properties changed");
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    sent = async { agent.tell(DesiredPropertiesChanged { desired }).await } => sent,
                };
                if let Err(e) = sent {
                    warn!(device = %device, error = %e, "desired change not delivered to agent");
                }
            }
            CloudNotification::Command { request, reply } => {
                let dispatcher = dispatcher.clone();
                served.spawn(async move {
                    let response = dispatcher.dispatch(&request).await;
                    // Caller may have stopped waiting
                    let _ = reply.send(response);
                });
            }
            CloudNotification::Message { message, reply } => {
                let dispatcher = dispatcher.clone();
                served.spawn(async move {
                    let disposition = dispatcher.deliver_message(&message).await;
                    let _ = reply.send(disposition);
                });
            }
        }

        while let Some(finished) = served.try_join_next() {
            if let Err(e) = finished {
                error!(device = %device, error = %e, "command task panicked");
            }
        }
    }

    while let Some(finished) = served.join_next().await {
        if let Err(e) = finished {
            error!(device = %device, error = %e, "command task panicked");
        }
    }
    debug!(device = %device, "notification pump stopped");
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Initialize> for DeviceAgent {
    type Reply = Result<AgentStatus, CoreError>;

    async fn handle(
        &mut self,
        _msg: Initialize,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.initialized {
            return Ok(self.status());
        }

        // Subscriptions are required, the twin contents are not
        let notifications = self.registry.subscribe(self.twin_id()).await?;
        self.status_cache = self.seed_status().await;

        self.shutdown_tx.send_replace(false);
        self.pump = Some(tokio::spawn(notification_pump(
            self.binding.device_name.clone(),
            notifications,
            self.dispatcher.clone(),
            self.myself.clone(),
            self.shutdown_tx.subscribe(),
        )));
        self.initialized = true;

        info!(
            device = %self.device_name(),
            twin = %self.twin_id(),
            status = %self.status_cache,
            commands = ?self.dispatcher.commands(),
            "device agent initialized"
        );

        Ok(self.status())
    }
}

impl Message<Poll> for DeviceAgent {
    type Reply = Result<ReadingOutcome, CoreError>;

    async fn handle(&mut self, _msg: Poll, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let attributes = match self.transport.read_attributes(self.device_name()).await {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!(device = %self.device_name(), error = %e, "device read failed");
                return Err(e.into());
            }
        };

        let reading = match ProductionReading::from_attributes(&attributes) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(device = %self.device_name(), error = %e, "discarding reading");
                return Err(e);
            }
        };

        let outcome = self.reconcile(&reading).await;
        self.spawn_telemetry(reading.to_telemetry());

        if outcome.is_ok() {
            self.polls += 1;
            self.last_polled = Some(Utc::now());
        }
        outcome
    }
}

impl Message<HandleReading> for DeviceAgent {
    type Reply = Result<ReadingOutcome, CoreError>;

    async fn handle(
        &mut self,
        msg: HandleReading,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let reading = ProductionReading::from_attributes(&msg.attributes)?;
        self.reconcile(&reading).await
    }
}

impl Message<SendTelemetry> for DeviceAgent {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: SendTelemetry,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.spawn_telemetry(msg.reading.to_telemetry());
    }
}

impl Message<DesiredPropertiesChanged> for DeviceAgent {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: DesiredPropertiesChanged,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let device = self.binding.device_name.clone();

        if msg.desired.emergency_requested() {
            match self.transport.invoke_operation(&device, EMERGENCY_STOP).await {
                Ok(Some(_)) => info!(device = %device, "emergency stop executed"),
                Ok(None) => warn!(device = %device, "emergency stop not acknowledged"),
                Err(e) => error!(device = %device, error = %e, "emergency stop failed"),
            }
        }

        if let Some(rate) = msg.desired.production_rate {
            if let Err(e) = self
                .transport
                .write_attribute(&device, names::PRODUCTION_RATE, AttributeValue::Int(rate))
                .await
            {
                error!(device = %device, rate, error = %e, "production rate write failed");
                return;
            }

            match self
                .registry
                .update_reported(self.twin_id(), &ReportedProperties::rate(rate))
                .await
            {
                Ok(()) => {
                    self.last_rate = Some(rate);
                    info!(device = %device, rate, "production rate applied");
                }
                Err(e) => {
                    warn!(twin = %self.twin_id(), rate, error = %e, "failed to report applied rate");
                }
            }
        }
    }
}

impl Message<Flush> for DeviceAgent {
    type Reply = ();

    async fn handle(&mut self, _msg: Flush, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.drain_jobs().await;
    }
}

impl Message<Shutdown> for DeviceAgent {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: Shutdown,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.stop_pump().await;
        self.drain_jobs().await;
        info!(device = %self.device_name(), "device agent shut down");
    }
}

impl Message<GetAgentStatus> for DeviceAgent {
    type Reply = AgentStatus;

    async fn handle(
        &mut self,
        _msg: GetAgentStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.status()
    }
}
