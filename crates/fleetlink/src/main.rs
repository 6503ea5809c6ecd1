//! fleetlink daemon
//!
//! Bridges production machines to their cloud twins: one kameo actor per
//! device, a fleet policy fed from the event stream, and a polling loop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use eyre::eyre;
use kameo::actor::Spawn;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetlink_core::{
    EventRouter, FleetPolicyEngine, FleetSupervisor, FleetSupervisorArgs, PollingLoop,
    RegisterDevice, ShutdownAll, device_pattern, select_devices,
};
use fleetlink_transport::{
    DeviceTransport, InMemoryRegistry, InMemoryStream, LogAlerting, LogTelemetry, SimulatedPlant,
};

mod config;
mod factory;
mod simulation;

use config::{Config, LogFormat};
use factory::SimulatedLinkFactory;
use simulation::FleetAggregator;

#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(about = "Industrial device to cloud twin bridge", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_tracing(level: &str, format: LogFormat) {
    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let path = cli.config.clone().or_else(Config::locate);
    let config = match &path {
        Some(path) => Config::load(path)
            .map_err(|e| eyre!("failed to load {}: {e}", path.display()))?,
        None => Config::default(),
    };

    init_tracing(
        &config.daemon.log_level,
        cli.log_format.unwrap_or(config.daemon.log_format),
    );
    match &path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no config file found, using defaults"),
    }
    if let Some(hint) = config.identity_hint() {
        warn!("{hint}");
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    info!("fleetlink starting");

    // In-process collaborators
    let plant = Arc::new(
        SimulatedPlant::new(config.simulation.devices.clone())
            .with_fault_probability(config.simulation.fault_probability),
    );
    let registry = Arc::new(InMemoryRegistry::new());
    for identity in &config.identity {
        registry.register_device(&identity.device_id).await;
    }
    let stream = Arc::new(InMemoryStream::new().with_receive_wait(config.router.receive_wait()));
    let aggregator = Arc::new(FleetAggregator::new(
        stream.clone(),
        Arc::new(LogTelemetry),
        &config.router,
        &config.simulation,
    ));

    // Discovery
    let browsed = plant.browse_devices().await?;
    let pattern = device_pattern(&config.agent.device_pattern)?;
    let bindings = select_devices(&browsed, &pattern, &config.identity).map_err(|e| {
        match config.identity_hint() {
            Some(hint) => eyre!("{e}; {hint}"),
            None => e.into(),
        }
    })?;

    // Agents
    let supervisor = FleetSupervisor::spawn(FleetSupervisorArgs {
        link_factory: Arc::new(SimulatedLinkFactory::new(
            plant.clone(),
            registry.clone(),
            aggregator,
            Arc::new(LogAlerting),
        )),
        agent_config: config.agent.clone(),
    });
    for binding in bindings {
        let name = binding.device_name.clone();
        supervisor
            .ask(RegisterDevice { binding })
            .await
            .map_err(|e| eyre!("failed to register {name}: {e}"))?;
    }

    // Control loop
    let policy = Arc::new(FleetPolicyEngine::new(
        registry.clone(),
        config.policy.clone(),
    ));
    let router = Arc::new(EventRouter::with_policy(stream, policy, &config.router));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_task = tokio::spawn(router.run(shutdown_rx.clone()));
    let polling_task = tokio::spawn(
        PollingLoop::new(supervisor.clone(), config.daemon.poll_interval()).run(shutdown_rx.clone()),
    );
    let plant_task = tokio::spawn(simulation::run_plant(
        plant,
        config.simulation.tick_interval(),
        shutdown_rx,
    ));

    info!("fleetlink running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    shutdown_tx.send_replace(true);
    polling_task.await?;
    router_task.await?;
    plant_task.await?;

    supervisor
        .ask(ShutdownAll)
        .await
        .map_err(|e| eyre!("failed to shut down agents: {e}"))?;
    supervisor.stop_gracefully().await.ok();

    info!("fleetlink stopped");
    Ok(())
}
