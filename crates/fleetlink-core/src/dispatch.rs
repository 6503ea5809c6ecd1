//! Remote command dispatch
//!
//! Maps command names to device operations. Every command, matched or not,
//! is answered with the same accepted response after a settle delay; the
//! outcome of the device operation is only visible in the log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use fleetlink_api::{CloudMessage, CommandRequest, CommandResponse, MessageDisposition};
use fleetlink_transport::DeviceTransport;

use crate::config::{AgentConfig, DeviceBinding};

/// Handler invoked for a remote command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: &CommandRequest);
}

/// Forwards a command to the device operation of the same name
pub struct DeviceOperation {
    device: String,
    transport: Arc<dyn DeviceTransport>,
}

impl DeviceOperation {
    pub fn new(device: impl Into<String>, transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            device: device.into(),
            transport,
        }
    }
}

#[async_trait]
impl CommandHandler for DeviceOperation {
    async fn handle(&self, request: &CommandRequest) {
        let address = format!("{}/{}", self.device, request.name);
        match self
            .transport
            .invoke_operation(&self.device, &request.name)
            .await
        {
            Ok(Some(_)) => info!(operation = %address, "device operation succeeded"),
            Ok(None) => warn!(operation = %address, "device operation not acknowledged"),
            Err(e) => error!(operation = %address, error = %e, "device operation failed"),
        }
    }
}

/// Default handler: acknowledges receipt without side effect
pub struct UnknownCommand {
    device: String,
}

#[async_trait]
impl CommandHandler for UnknownCommand {
    async fn handle(&self, request: &CommandRequest) {
        warn!(device = %self.device, command = %request.name, "unknown command received");
    }
}

/// Result of the two-phase route lookup
pub enum RouteMatch<'a> {
    /// Exact command-name match
    Named(&'a Arc<dyn CommandHandler>),
    /// Default handler
    Fallback(&'a Arc<dyn CommandHandler>),
}

/// Ordered dispatch table with a distinguished default handler
pub struct CommandDispatcher {
    device: String,
    routes: BTreeMap<String, Arc<dyn CommandHandler>>,
    fallback: Arc<dyn CommandHandler>,
    settle: Duration,
}

impl CommandDispatcher {
    /// Empty table for a device; unknown commands go to [`UnknownCommand`]
    pub fn new(device: impl Into<String>, settle: Duration) -> Self {
        let device = device.into();
        Self {
            fallback: Arc::new(UnknownCommand {
                device: device.clone(),
            }),
            device,
            routes: BTreeMap::new(),
            settle,
        }
    }

    /// Table routing each configured command to the device operation of the same name
    pub fn for_device(
        binding: &DeviceBinding,
        transport: Arc<dyn DeviceTransport>,
        config: &AgentConfig,
    ) -> Self {
        let mut dispatcher = Self::new(binding.device_name.clone(), config.command_settle());
        for command in &config.commands {
            dispatcher.register(
                command.clone(),
                Arc::new(DeviceOperation::new(
                    binding.device_name.clone(),
                    transport.clone(),
                )),
            );
        }
        dispatcher
    }

    /// Add or replace the handler for a command name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.routes.insert(name.into(), handler);
    }

    /// Exact match first, default handler otherwise
    #[must_use]
    pub fn route(&self, name: &str) -> RouteMatch<'_> {
        match self.routes.get(name) {
            Some(handler) => RouteMatch::Named(handler),
            None => RouteMatch::Fallback(&self.fallback),
        }
    }

    /// Registered command names, in lexicographic order
    #[must_use]
    pub fn commands(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Run the handler for a command and answer after the settle delay
    pub async fn dispatch(&self, request: &CommandRequest) -> CommandResponse {
        match self.route(&request.name) {
            RouteMatch::Named(handler) => {
                info!(device = %self.device, command = %request.name, "command received");
                handler.handle(request).await;
            }
            RouteMatch::Fallback(handler) => handler.handle(request).await,
        }

        tokio::time::sleep(self.settle).await;
        CommandResponse::accepted()
    }

    /// Log a cloud-to-device message and complete it
    pub async fn deliver_message(&self, message: &CloudMessage) -> MessageDisposition {
        info!(
            device = %self.device,
            message_id = %message.id,
            body = %message.body,
            "cloud message received"
        );
        MessageDisposition::Completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fleetlink_api::commands::operations::{EMERGENCY_STOP, RESET_ERROR_STATUS};
    use fleetlink_api::{Attribute, AttributeValue};
    use fleetlink_transport::{OperationAck, TransportError};

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        invoked: Mutex<Vec<String>>,
        acknowledge: bool,
    }

    #[async_trait]
    impl DeviceTransport for RecordingTransport {
        async fn browse_devices(&self) -> Result<Vec<String>, TransportError> {
            Ok(vec![])
        }

        async fn read_attributes(&self, device: &str) -> Result<Vec<Attribute>, TransportError> {
            Err(TransportError::DeviceNotFound(device.to_string()))
        }

        async fn write_attribute(
            &self,
            _device: &str,
            _attribute: &str,
            _value: AttributeValue,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn invoke_operation(
            &self,
            device: &str,
            operation: &str,
        ) -> Result<Option<OperationAck>, TransportError> {
            self.invoked
                .lock()
                .unwrap()
                .push(format!("{device}/{operation}"));
            Ok(self.acknowledge.then(OperationAck::default))
        }

        fn transport_type(&self) -> &'static str {
            "recording"
        }
    }

    fn dispatcher(transport: Arc<RecordingTransport>) -> CommandDispatcher {
        let config = AgentConfig {
            command_settle_ms: 1,
            ..AgentConfig::default()
        };
        CommandDispatcher::for_device(
            &DeviceBinding::new("Device 1", "device-1"),
            transport,
            &config,
        )
    }

    #[test]
    fn test_routes_are_ordered() {
        let dispatcher = dispatcher(Arc::new(RecordingTransport::default()));
        assert_eq!(dispatcher.commands(), vec![EMERGENCY_STOP, RESET_ERROR_STATUS]);
        assert!(matches!(dispatcher.route(EMERGENCY_STOP), RouteMatch::Named(_)));
        assert!(matches!(dispatcher.route("emergencystop"), RouteMatch::Fallback(_)));
    }

    #[tokio::test]
    async fn test_registered_command_invokes_operation() {
        let transport = Arc::new(RecordingTransport {
            acknowledge: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(transport.clone());

        let response = dispatcher
            .dispatch(&CommandRequest::new(RESET_ERROR_STATUS))
            .await;

        assert!(response.is_accepted());
        assert_eq!(
            *transport.invoked.lock().unwrap(),
            vec!["Device 1/ResetErrorStatus".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unacknowledged_operation_still_accepted() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(transport.clone());

        let response = dispatcher.dispatch(&CommandRequest::new(EMERGENCY_STOP)).await;
        assert_eq!(response, CommandResponse::accepted());
        assert_eq!(transport.invoked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_has_no_side_effect() {
        let transport = Arc::new(RecordingTransport {
            acknowledge: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(transport.clone());

        let known = dispatcher.dispatch(&CommandRequest::new(EMERGENCY_STOP)).await;
        let unknown = dispatcher.dispatch(&CommandRequest::new("SelfDestruct")).await;

        assert_eq!(known, unknown);
        assert_eq!(transport.invoked.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_waits_for_settle_delay() {
        let dispatcher = CommandDispatcher::new("Device 1", Duration::from_millis(500));
        let started = tokio::time::Instant::now();

        dispatcher.dispatch(&CommandRequest::new("Ping")).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_messages_are_completed() {
        let dispatcher = CommandDispatcher::new("Device 1", Duration::ZERO);
        let message = CloudMessage {
            id: "m-1".to_string(),
            body: "hello".to_string(),
            properties: Default::default(),
        };
        assert_eq!(
            dispatcher.deliver_message(&message).await,
            MessageDisposition::Completed
        );
    }
}
