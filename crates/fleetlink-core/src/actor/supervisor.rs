//! `FleetSupervisor`: Fleet-wide agent registry
//!
//! Spawns one `DeviceAgent` per discovered device and polls them in
//! registration order.

use std::sync::Arc;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, SendError};
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tracing::{info, warn};

use fleetlink_transport::{Alerting, DeviceTransport, ShadowRegistry, TelemetrySink};

use crate::actor::agent::{DeviceAgent, DeviceAgentArgs};
use crate::config::{AgentConfig, DeviceBinding};
use crate::error::CoreError;
use crate::message::{
    AgentStatus, Flush, FlushAll, GetAgentStatus, GetDeviceStatus, Initialize, ListDevices, Poll,
    PollDevice, PollNext, ReadingOutcome, RegisterDevice, Shutdown, ShutdownAll,
};

/// Collaborator handles for one device
pub struct DeviceLinks {
    pub transport: Arc<dyn DeviceTransport>,
    pub registry: Arc<dyn ShadowRegistry>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub alerting: Arc<dyn Alerting>,
}

/// Factory trait for connecting a device's collaborators
///
/// Allows injection of different transports and registries per device.
#[async_trait::async_trait]
pub trait DeviceLinkFactory: Send + Sync {
    async fn connect(&self, binding: &DeviceBinding) -> Result<DeviceLinks, CoreError>;
}

/// Arguments for spawning a `FleetSupervisor`
pub struct FleetSupervisorArgs {
    /// Factory for device collaborators
    pub link_factory: Arc<dyn DeviceLinkFactory>,
    /// Settings passed to every agent
    pub agent_config: AgentConfig,
}

struct ManagedDevice {
    name: String,
    agent: ActorRef<DeviceAgent>,
}

/// Supervisor owning every device agent
pub struct FleetSupervisor {
    /// Agents in registration order
    devices: Vec<ManagedDevice>,
    /// Index of the next device to poll
    cursor: usize,
    link_factory: Arc<dyn DeviceLinkFactory>,
    agent_config: AgentConfig,
}

/// Turn an `ask` failure into a `CoreError`, keeping handler errors intact
fn flatten<M>(error: SendError<M, CoreError>) -> CoreError {
    match error {
        SendError::HandlerError(e) => e,
        other => CoreError::ActorError(other.to_string()),
    }
}

impl FleetSupervisor {
    fn agent(&self, device_name: &str) -> Result<&ActorRef<DeviceAgent>, CoreError> {
        self.devices
            .iter()
            .find(|d| d.name == device_name)
            .map(|d| &d.agent)
            .ok_or_else(|| CoreError::DeviceNotFound(device_name.to_string()))
    }

    async fn spawn_agent(&self, binding: DeviceBinding) -> Result<ActorRef<DeviceAgent>, CoreError> {
        let links = self.link_factory.connect(&binding).await?;

        let args = DeviceAgentArgs {
            binding: binding.clone(),
            transport: links.transport,
            registry: links.registry,
            telemetry: links.telemetry,
            alerting: links.alerting,
            config: self.agent_config.clone(),
        };

        let agent = DeviceAgent::spawn(args);
        info!(device = %binding.device_name, twin = %binding.twin_id, "spawned DeviceAgent");

        Ok(agent)
    }
}

impl Actor for FleetSupervisor {
    type Args = FleetSupervisorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "FleetSupervisor starting");

        Ok(Self {
            devices: Vec::new(),
            cursor: 0,
            link_factory: args.link_factory,
            agent_config: args.agent_config,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "FleetSupervisor stopping");

        for device in &self.devices {
            info!(device = %device.name, "stopping DeviceAgent");
            device.agent.stop_gracefully().await.ok();
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RegisterDevice> for FleetSupervisor {
    type Reply = Result<AgentStatus, CoreError>;

    async fn handle(
        &mut self,
        msg: RegisterDevice,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let name = msg.binding.device_name.clone();

        if self.agent(&name).is_ok() {
            return Err(CoreError::DeviceAlreadyExists(name));
        }

        let agent = self.spawn_agent(msg.binding).await?;
        match agent.ask(Initialize).await {
            Ok(status) => {
                self.devices.push(ManagedDevice { name, agent });
                Ok(status)
            }
            Err(e) => {
                warn!(device = %name, error = %e, "device agent failed to initialize");
                agent.stop_gracefully().await.ok();
                Err(flatten(e))
            }
        }
    }
}

impl Message<PollNext> for FleetSupervisor {
    type Reply = Result<ReadingOutcome, CoreError>;

    async fn handle(
        &mut self,
        _msg: PollNext,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.devices.is_empty() {
            return Err(CoreError::NoDevices);
        }

        let index = self.cursor % self.devices.len();
        self.cursor = (index + 1) % self.devices.len();

        self.devices[index].agent.ask(Poll).await.map_err(flatten)
    }
}

impl Message<PollDevice> for FleetSupervisor {
    type Reply = Result<ReadingOutcome, CoreError>;

    async fn handle(
        &mut self,
        msg: PollDevice,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.agent(&msg.device_name)?
            .ask(Poll)
            .await
            .map_err(flatten)
    }
}

impl Message<GetDeviceStatus> for FleetSupervisor {
    type Reply = Result<AgentStatus, CoreError>;

    async fn handle(
        &mut self,
        msg: GetDeviceStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.agent(&msg.device_name)?
            .ask(GetAgentStatus)
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }
}

impl Message<ListDevices> for FleetSupervisor {
    type Reply = Vec<AgentStatus>;

    async fn handle(
        &mut self,
        _msg: ListDevices,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut statuses = Vec::with_capacity(self.devices.len());

        for device in &self.devices {
            match device.agent.ask(GetAgentStatus).await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(device = %device.name, error = %e, "failed to get device status");
                }
            }
        }

        statuses
    }
}

impl Message<FlushAll> for FleetSupervisor {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: FlushAll,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for device in &self.devices {
            if let Err(e) = device.agent.ask(Flush).await {
                warn!(device = %device.name, error = %e, "failed to flush device agent");
            }
        }
    }
}

impl Message<ShutdownAll> for FleetSupervisor {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: ShutdownAll,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        for device in &self.devices {
            if let Err(e) = device.agent.ask(Shutdown).await {
                warn!(device = %device.name, error = %e, "failed to shut down device agent");
            }
        }
        info!(devices = self.devices.len(), "all device agents shut down");
    }
}
