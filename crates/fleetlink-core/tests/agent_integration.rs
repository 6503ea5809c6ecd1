use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kameo::actor::{ActorRef, Spawn};
use tokio::sync::mpsc;

use fleetlink_api::attributes::names;
use fleetlink_api::{
    Attribute, AttributeValue, CloudMessage, CommandRequest, DesiredProperties,
    MessageDisposition, ReportedProperties, StatusBitmask, TelemetryEvent, Twin, VersionTag,
};
use fleetlink_core::*;
use fleetlink_transport::{
    AlertError, Alerting, CloudNotification, DeviceTransport, InMemoryRegistry, OperationAck,
    RegistryError, ShadowRegistry, TelemetrySink, TransportError,
};

const TWIN: &str = "device-1";
const DEVICE: &str = "Device 1";

// Mock implementations

/// How the mock device answers an operation
#[derive(Debug, Clone, Copy, Default)]
enum OperationReply {
    #[default]
    Ack,
    NoAck,
    Fail,
}

#[derive(Default)]
struct MockDevice {
    rate: Mutex<i64>,
    device_error: Mutex<i64>,
    operations: Mutex<Vec<String>>,
    reject_writes: bool,
    operation_reply: OperationReply,
}

impl MockDevice {
    fn set_error(&self, raw: i64) {
        *self.device_error.lock().unwrap() = raw;
    }

    fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceTransport for MockDevice {
    async fn browse_devices(&self) -> Result<Vec<String>, TransportError> {
        Ok(vec![DEVICE.to_string()])
    }

    async fn read_attributes(&self, _device: &str) -> Result<Vec<Attribute>, TransportError> {
        Ok(attributes(
            *self.rate.lock().unwrap(),
            *self.device_error.lock().unwrap(),
        ))
    }

    async fn write_attribute(
        &self,
        _device: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), TransportError> {
        if self.reject_writes {
            return Err(TransportError::WriteRejected {
                attribute: attribute.to_string(),
                reason: "locked".to_string(),
            });
        }
        *self.rate.lock().unwrap() = value.as_i64().unwrap();
        Ok(())
    }

    async fn invoke_operation(
        &self,
        device: &str,
        operation: &str,
    ) -> Result<Option<OperationAck>, TransportError> {
        self.operations
            .lock()
            .unwrap()
            .push(format!("{device}/{operation}"));
        match self.operation_reply {
            OperationReply::Ack => Ok(Some(OperationAck::default())),
            OperationReply::NoAck => Ok(None),
            OperationReply::Fail => Err(TransportError::ConnectionFailed("bus down".to_string())),
        }
    }

    fn transport_type(&self) -> &'static str {
        "mock"
    }
}

#[derive(Default)]
struct RecordingAlerting {
    alerts: Mutex<Vec<String>>,
}

#[async_trait]
impl Alerting for RecordingAlerting {
    async fn notify(&self, _device_id: &str, message: &str) -> Result<(), AlertError> {
        self.alerts.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
    unavailable: bool,
}

impl RecordingTelemetry {
    fn status_changes(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::StatusChanged { .. }))
            .count()
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn send(&self, _device_id: &str, event: &TelemetryEvent) -> Result<(), TransportError> {
        if self.unavailable {
            return Err(TransportError::IoError("telemetry link down".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Registry recording every accepted reported patch
#[derive(Default)]
struct RecordingRegistry {
    inner: InMemoryRegistry,
    reported: Mutex<Vec<ReportedProperties>>,
    /// Number of upcoming reported writes to refuse
    refuse_reported: AtomicUsize,
}

#[async_trait]
impl ShadowRegistry for RecordingRegistry {
    async fn get_twin(&self, device_id: &str) -> Result<Option<Twin>, RegistryError> {
        self.inner.get_twin(device_id).await
    }

    async fn update_reported(
        &self,
        device_id: &str,
        patch: &ReportedProperties,
    ) -> Result<(), RegistryError> {
        if self
            .refuse_reported
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RegistryError::Unavailable("registry throttled".to_string()));
        }
        self.reported.lock().unwrap().push(patch.clone());
        self.inner.update_reported(device_id, patch).await
    }

    async fn update_desired(
        &self,
        device_id: &str,
        patch: &DesiredProperties,
        version: VersionTag,
    ) -> Result<VersionTag, RegistryError> {
        self.inner.update_desired(device_id, patch, version).await
    }

    async fn subscribe(
        &self,
        device_id: &str,
    ) -> Result<mpsc::Receiver<CloudNotification>, RegistryError> {
        self.inner.subscribe(device_id).await
    }
}

fn attributes(rate: i64, device_error: i64) -> Vec<Attribute> {
    vec![
        Attribute::new(names::PRODUCTION_STATUS, 1),
        Attribute::new(names::PRODUCTION_RATE, rate),
        Attribute::new(names::WORKORDER_ID, "wo-1"),
        Attribute::new(names::TEMPERATURE, 65.0),
        Attribute::new(names::GOOD_COUNT, 10),
        Attribute::new(names::BAD_COUNT, 1),
        Attribute::new(names::DEVICE_ERROR, device_error),
    ]
}

struct Harness {
    device: Arc<MockDevice>,
    registry: Arc<RecordingRegistry>,
    alerting: Arc<RecordingAlerting>,
    telemetry: Arc<RecordingTelemetry>,
    agent: ActorRef<DeviceAgent>,
}

impl Harness {
    async fn start(device: MockDevice, seed: Option<ReportedProperties>) -> Self {
        Self::start_with(device, RecordingTelemetry::default(), seed).await
    }

    async fn start_with(
        device: MockDevice,
        telemetry: RecordingTelemetry,
        seed: Option<ReportedProperties>,
    ) -> Self {
        let device = Arc::new(device);
        let registry = Arc::new(RecordingRegistry::default());
        registry.inner.register_device(TWIN).await;
        if let Some(seed) = seed {
            registry.inner.update_reported(TWIN, &seed).await.unwrap();
        }
        let alerting = Arc::new(RecordingAlerting::default());
        let telemetry = Arc::new(telemetry);

        let agent = DeviceAgent::spawn(DeviceAgentArgs {
            binding: DeviceBinding::new(DEVICE, TWIN),
            transport: device.clone(),
            registry: registry.clone(),
            telemetry: telemetry.clone(),
            alerting: alerting.clone(),
            config: AgentConfig {
                command_settle_ms: 0,
                ..AgentConfig::default()
            },
        });
        agent.ask(Initialize).await.unwrap();

        Self {
            device,
            registry,
            alerting,
            telemetry,
            agent,
        }
    }

    async fn handle(&self, rate: i64, device_error: i64) -> ReadingOutcome {
        self.agent
            .ask(HandleReading {
                attributes: attributes(rate, device_error),
            })
            .await
            .unwrap()
    }

    async fn flush(&self) {
        self.agent.ask(Flush).await.unwrap();
    }

    fn alerts(&self) -> Vec<String> {
        self.alerting.alerts.lock().unwrap().clone()
    }

    fn last_reported(&self) -> ReportedProperties {
        self.registry.reported.lock().unwrap().last().cloned().unwrap()
    }

    async fn twin(&self) -> Twin {
        self.registry.get_twin(TWIN).await.unwrap().unwrap()
    }

    async fn stop(self) {
        self.agent.ask(Shutdown).await.unwrap();
        self.agent.stop_gracefully().await.unwrap();
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_new_fault_alerts_once_with_new_names() {
    let h = Harness::start(MockDevice::default(), None).await;

    let outcome = h.handle(80, 0b0010).await;
    assert_eq!(outcome.newly_set, StatusBitmask::POWER_FAILURE);

    let outcome = h.handle(80, 0b0110).await;
    assert_eq!(outcome.previous, StatusBitmask::POWER_FAILURE);
    assert_eq!(outcome.newly_set, StatusBitmask::SENSOR_FAILURE);
    h.flush().await;

    let alerts = h.alerts();
    assert_eq!(alerts.len(), 2);
    assert!(alerts[1].ends_with("SensorFailure"));
    assert!(!alerts[1].contains("PowerFailure"));

    let twin = h.twin().await;
    assert_eq!(
        twin.reported.device_status,
        Some(vec!["PowerFailure".to_string(), "SensorFailure".to_string()])
    );
    assert_eq!(twin.reported.production_rate, Some(80));
    assert_eq!(h.telemetry.status_changes(), 2);

    h.stop().await;
}

#[tokio::test]
async fn test_unchanged_status_only_republishes_rate() {
    let h = Harness::start(MockDevice::default(), None).await;

    h.handle(90, 0b0001).await;
    h.flush().await;
    let alerts_before = h.alerts().len();

    let outcome = h.handle(70, 0b0001).await;
    h.flush().await;

    assert!(!outcome.status_changed());
    assert_eq!(h.alerts().len(), alerts_before);
    assert_eq!(h.last_reported(), ReportedProperties::rate(70));

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.status, StatusBitmask::EMERGENCY_STOP);
    assert_eq!(status.last_rate, Some(70));

    h.stop().await;
}

#[tokio::test]
async fn test_cleared_fault_publishes_without_alert() {
    let h = Harness::start(MockDevice::default(), None).await;

    h.handle(50, 0b0011).await;
    let outcome = h.handle(50, 0b0001).await;
    h.flush().await;

    assert!(outcome.status_changed());
    assert!(!outcome.alerted());
    assert_eq!(h.alerts().len(), 1);
    assert_eq!(h.telemetry.status_changes(), 2);
    assert_eq!(
        h.twin().await.reported.device_status,
        Some(vec!["EmergencyStop".to_string()])
    );

    h.stop().await;
}

#[tokio::test]
async fn test_cache_seeded_from_reported_status() {
    let seed = ReportedProperties {
        production_rate: Some(40),
        device_status: Some(vec![
            "EmergencyStop".to_string(),
            "SensorFailure".to_string(),
            "Overheating".to_string(),
        ]),
    };
    let h = Harness::start(MockDevice::default(), Some(seed)).await;

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.status.bits(), 0b101);
    assert!(status.initialized);

    let outcome = h.handle(40, 0b101).await;
    h.flush().await;
    assert!(!outcome.status_changed());
    assert!(h.alerts().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_unknown_bits_are_ignored() {
    let h = Harness::start(MockDevice::default(), None).await;

    let outcome = h.handle(30, 0b1_0000).await;
    assert_eq!(outcome.current, StatusBitmask::empty());
    assert!(!outcome.status_changed());

    h.stop().await;
}

#[tokio::test]
async fn test_poll_reads_device_and_sends_telemetry() {
    let device = MockDevice::default();
    device.set_error(0b1000);
    *device.rate.lock().unwrap() = 60;
    let h = Harness::start(device, None).await;

    let outcome = h.agent.ask(Poll).await.unwrap();
    h.flush().await;

    assert_eq!(outcome.device_name, DEVICE);
    assert_eq!(outcome.current, StatusBitmask::UNKNOWN);
    let events = h.telemetry.events.lock().unwrap().clone();
    assert!(events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::Production { good_count: 10, .. })));

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.polls, 1);
    assert!(status.last_polled.is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_malformed_reading_is_rejected() {
    let h = Harness::start(MockDevice::default(), None).await;

    let result = h
        .agent
        .ask(HandleReading {
            attributes: vec![Attribute::new(names::DEVICE_ERROR, 1)],
        })
        .await;
    assert!(result.is_err());

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.status, StatusBitmask::empty());

    h.stop().await;
}

#[tokio::test]
async fn test_desired_emergency_invokes_stop() {
    let h = Harness::start(MockDevice::default(), None).await;

    h.registry
        .inner
        .set_desired(TWIN, &DesiredProperties::emergency(true))
        .await
        .unwrap();

    let device = h.device.clone();
    eventually(|| !device.operations().is_empty()).await;
    assert_eq!(h.device.operations(), vec!["Device 1/EmergencyStop"]);

    h.stop().await;
}

#[tokio::test]
async fn test_desired_rate_is_written_and_echoed() {
    let h = Harness::start(MockDevice::default(), None).await;

    h.registry
        .inner
        .set_desired(TWIN, &DesiredProperties::rate(35))
        .await
        .unwrap();

    let device = h.device.clone();
    eventually(|| *device.rate.lock().unwrap() == 35).await;

    for _ in 0..100 {
        if h.twin().await.reported.production_rate == Some(35) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.twin().await.reported.production_rate, Some(35));
    assert!(h.device.operations().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_rejected_rate_write_is_not_echoed() {
    let device = MockDevice {
        reject_writes: true,
        ..MockDevice::default()
    };
    let h = Harness::start(device, None).await;

    h.registry
        .inner
        .set_desired(TWIN, &DesiredProperties::rate(20))
        .await
        .unwrap();

    // Desired changes are applied in mailbox order, ahead of this status query
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.last_rate, None);
    assert!(h.registry.reported.lock().unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_failed_emergency_stop_keeps_agent_running() {
    for reply in [OperationReply::Fail, OperationReply::NoAck] {
        let device = MockDevice {
            operation_reply: reply,
            ..MockDevice::default()
        };
        let h = Harness::start(device, None).await;

        h.registry
            .inner
            .set_desired(TWIN, &DesiredProperties::emergency(true))
            .await
            .unwrap();

        let device = h.device.clone();
        eventually(|| !device.operations().is_empty()).await;

        let outcome = h.agent.ask(Poll).await;
        assert!(outcome.is_ok(), "{reply:?}: {outcome:?}");
        assert_eq!(h.device.operations(), vec!["Device 1/EmergencyStop"]);

        h.stop().await;
    }
}

#[tokio::test]
async fn test_cleared_trigger_invokes_nothing() {
    let h = Harness::start(MockDevice::default(), None).await;

    h.registry
        .inner
        .set_desired(TWIN, &DesiredProperties::emergency(false))
        .await
        .unwrap();
    h.registry
        .inner
        .set_desired(TWIN, &DesiredProperties::rate(25))
        .await
        .unwrap();

    // Patches are applied in order, so the rate landing means the trigger was seen
    let device = h.device.clone();
    eventually(|| *device.rate.lock().unwrap() == 25).await;
    h.agent.ask(GetAgentStatus).await.unwrap();
    assert!(h.device.operations().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_telemetry_failure_does_not_fail_poll() {
    let telemetry = RecordingTelemetry {
        unavailable: true,
        ..RecordingTelemetry::default()
    };
    let device = MockDevice::default();
    device.set_error(0b0100);
    let h = Harness::start_with(device, telemetry, None).await;

    assert!(h.agent.ask(Poll).await.is_ok());
    h.flush().await;
    assert!(h.agent.ask(Poll).await.is_ok());
    h.flush().await;

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.polls, 2);
    assert_eq!(status.status, StatusBitmask::SENSOR_FAILURE);
    assert!(h.telemetry.events.lock().unwrap().is_empty());
    assert_eq!(h.alerts().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_unpublished_status_is_republished_next_reading() {
    let h = Harness::start(MockDevice::default(), None).await;
    h.registry.refuse_reported.store(1, Ordering::SeqCst);

    let failed = h
        .agent
        .ask(HandleReading {
            attributes: attributes(80, 0b0010),
        })
        .await;
    assert!(failed.is_err());
    assert!(h.registry.reported.lock().unwrap().is_empty());

    // Same status again: no new alert, but the status still has to reach the twin
    let outcome = h.handle(80, 0b0010).await;
    h.flush().await;
    assert!(!outcome.status_changed());
    assert_eq!(
        h.last_reported(),
        ReportedProperties::rate(80).with_status(StatusBitmask::POWER_FAILURE)
    );
    assert_eq!(h.alerts().len(), 1);
    assert_eq!(
        h.twin().await.reported.device_status,
        Some(vec!["PowerFailure".to_string()])
    );

    // Once published, only the rate is republished
    h.handle(75, 0b0010).await;
    assert_eq!(h.last_reported(), ReportedProperties::rate(75));

    let status = h.agent.ask(GetAgentStatus).await.unwrap();
    assert_eq!(status.last_rate, Some(75));

    h.stop().await;
}

#[tokio::test]
async fn test_commands_are_accepted_matched_or_not() {
    let h = Harness::start(MockDevice::default(), None).await;

    let known = h
        .registry
        .inner
        .invoke_command(TWIN, CommandRequest::new("ResetErrorStatus"))
        .await
        .unwrap();
    assert_eq!(h.device.operations(), vec!["Device 1/ResetErrorStatus"]);

    let unknown = h
        .registry
        .inner
        .invoke_command(TWIN, CommandRequest::new("Calibrate"))
        .await
        .unwrap();

    assert!(known.is_accepted());
    assert_eq!(known, unknown);
    assert_eq!(h.device.operations().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_cloud_message_is_completed() {
    let h = Harness::start(MockDevice::default(), None).await;

    let disposition = h
        .registry
        .inner
        .send_message(
            TWIN,
            CloudMessage {
                id: "msg-1".to_string(),
                body: "maintenance at noon".to_string(),
                properties: Default::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(disposition, MessageDisposition::Completed);

    h.stop().await;
}

// Supervisor

struct TestLinkFactory {
    registry: Arc<InMemoryRegistry>,
    alerting: Arc<RecordingAlerting>,
}

#[async_trait]
impl DeviceLinkFactory for TestLinkFactory {
    async fn connect(&self, _binding: &DeviceBinding) -> Result<DeviceLinks, CoreError> {
        Ok(DeviceLinks {
            transport: Arc::new(MockDevice::default()),
            registry: self.registry.clone(),
            telemetry: Arc::new(RecordingTelemetry::default()),
            alerting: self.alerting.clone(),
        })
    }
}

async fn supervisor(twins: &[&str]) -> ActorRef<FleetSupervisor> {
    let registry = Arc::new(InMemoryRegistry::new());
    for twin in twins {
        registry.register_device(twin).await;
    }
    FleetSupervisor::spawn(FleetSupervisorArgs {
        link_factory: Arc::new(TestLinkFactory {
            registry,
            alerting: Arc::new(RecordingAlerting::default()),
        }),
        agent_config: AgentConfig::default(),
    })
}

#[tokio::test]
async fn test_supervisor_polls_round_robin() {
    let supervisor = supervisor(&["device-1", "device-2"]).await;

    for (name, twin) in [("Device 1", "device-1"), ("Device 2", "device-2")] {
        supervisor
            .ask(RegisterDevice {
                binding: DeviceBinding::new(name, twin),
            })
            .await
            .unwrap();
    }

    let mut polled = Vec::new();
    for _ in 0..3 {
        polled.push(supervisor.ask(PollNext).await.unwrap().device_name);
    }
    assert_eq!(polled, vec!["Device 1", "Device 2", "Device 1"]);

    let devices = supervisor.ask(ListDevices).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].polls, 2);

    let status = supervisor
        .ask(GetDeviceStatus {
            device_name: "Device 2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(status.twin_id, "device-2");

    supervisor.ask(FlushAll).await.unwrap();
    supervisor.ask(ShutdownAll).await.unwrap();
    supervisor.stop_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_supervisor_rejects_duplicates_and_unknown_twins() {
    let supervisor = supervisor(&["device-1"]).await;

    supervisor
        .ask(RegisterDevice {
            binding: DeviceBinding::new("Device 1", "device-1"),
        })
        .await
        .unwrap();

    let duplicate = supervisor
        .ask(RegisterDevice {
            binding: DeviceBinding::new("Device 1", "device-1"),
        })
        .await;
    assert!(duplicate.is_err());

    // Subscribing to a twin that does not exist fails initialization
    let unknown = supervisor
        .ask(RegisterDevice {
            binding: DeviceBinding::new("Device 2", "device-9"),
        })
        .await;
    assert!(unknown.is_err());
    assert_eq!(supervisor.ask(ListDevices).await.unwrap().len(), 1);

    let missing = supervisor
        .ask(PollDevice {
            device_name: "Device 3".to_string(),
        })
        .await;
    assert!(missing.is_err());

    supervisor.stop_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_supervisor_without_devices() {
    let supervisor = supervisor(&[]).await;
    assert!(supervisor.ask(PollNext).await.is_err());
    supervisor.stop_gracefully().await.unwrap();
}
