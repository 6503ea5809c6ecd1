//! In-memory twin registry

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use fleetlink_api::{
    CloudMessage, CommandRequest, CommandResponse, DesiredProperties, MessageDisposition,
    ReportedProperties, Twin, VersionTag,
};

use crate::error::RegistryError;
use crate::traits::ShadowRegistry;
use crate::types::CloudNotification;

/// Buffered notifications per subscriber
const SUBSCRIPTION_CAPACITY: usize = 64;

struct TwinEntry {
    twin: Twin,
    subscribers: Vec<mpsc::Sender<CloudNotification>>,
}

impl TwinEntry {
    fn live_subscriber(&mut self) -> Option<mpsc::Sender<CloudNotification>> {
        self.subscribers.retain(|tx| !tx.is_closed());
        self.subscribers.last().cloned()
    }
}

/// Registry keeping twins in process memory
///
/// Every write bumps the twin version. Desired-property patches are pushed
/// to the device's subscribers after they are stored.
#[derive(Default)]
pub struct InMemoryRegistry {
    twins: Mutex<HashMap<String, TwinEntry>>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty twin for a device; existing twins are kept
    pub async fn register_device(&self, device_id: &str) {
        let mut twins = self.twins.lock().await;
        twins.entry(device_id.to_string()).or_insert_with(|| {
            info!(twin = %device_id, "twin created");
            TwinEntry {
                twin: Twin {
                    device_id: device_id.to_string(),
                    reported: ReportedProperties::default(),
                    desired: DesiredProperties::default(),
                    version: VersionTag::default(),
                },
                subscribers: Vec::new(),
            }
        });
    }

    /// Unconditional desired-property write, as an operator would do
    ///
    /// # Errors
    /// Returns error if the twin does not exist
    pub async fn set_desired(
        &self,
        device_id: &str,
        patch: &DesiredProperties,
    ) -> Result<VersionTag, RegistryError> {
        let version = self
            .get_twin(device_id)
            .await?
            .ok_or_else(|| RegistryError::TwinNotFound(device_id.to_string()))?
            .version;
        self.update_desired(device_id, patch, version).await
    }

    /// Invoke a direct command on a connected device
    ///
    /// # Errors
    /// Returns error if the twin does not exist or no device is listening
    pub async fn invoke_command(
        &self,
        device_id: &str,
        request: CommandRequest,
    ) -> Result<CommandResponse, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.push(device_id, CloudNotification::Command { request, reply })
            .await?;
        response
            .await
            .map_err(|_| RegistryError::SubscriptionClosed(device_id.to_string()))
    }

    /// Send a cloud-to-device message and wait for its disposition
    ///
    /// # Errors
    /// Returns error if the twin does not exist or no device is listening
    pub async fn send_message(
        &self,
        device_id: &str,
        message: CloudMessage,
    ) -> Result<MessageDisposition, RegistryError> {
        let (reply, disposition) = oneshot::channel();
        self.push(device_id, CloudNotification::Message { message, reply })
            .await?;
        disposition
            .await
            .map_err(|_| RegistryError::SubscriptionClosed(device_id.to_string()))
    }

    async fn push(
        &self,
        device_id: &str,
        notification: CloudNotification,
    ) -> Result<(), RegistryError> {
        let subscriber = {
            let mut twins = self.twins.lock().await;
            let entry = twins
                .get_mut(device_id)
                .ok_or_else(|| RegistryError::TwinNotFound(device_id.to_string()))?;
            entry.live_subscriber()
        };
        let tx = subscriber.ok_or_else(|| RegistryError::SubscriptionClosed(device_id.to_string()))?;
        tx.send(notification)
            .await
            .map_err(|_| RegistryError::SubscriptionClosed(device_id.to_string()))
    }
}

#[async_trait]
impl ShadowRegistry for InMemoryRegistry {
    async fn get_twin(&self, device_id: &str) -> Result<Option<Twin>, RegistryError> {
        Ok(self
            .twins
            .lock()
            .await
            .get(device_id)
            .map(|entry| entry.twin.clone()))
    }

    #[instrument(skip(self, patch), level = "debug")]
    async fn update_reported(
        &self,
        device_id: &str,
        patch: &ReportedProperties,
    ) -> Result<(), RegistryError> {
        let mut twins = self.twins.lock().await;
        let entry = twins
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::TwinNotFound(device_id.to_string()))?;

        entry.twin.reported.merge(patch);
        entry.twin.version = entry.twin.version.next();
        debug!(twin = %device_id, version = %entry.twin.version, "reported properties updated");
        Ok(())
    }

    #[instrument(skip(self, patch), level = "debug")]
    async fn update_desired(
        &self,
        device_id: &str,
        patch: &DesiredProperties,
        version: VersionTag,
    ) -> Result<VersionTag, RegistryError> {
        let (new_version, subscribers) = {
            let mut twins = self.twins.lock().await;
            let entry = twins
                .get_mut(device_id)
                .ok_or_else(|| RegistryError::TwinNotFound(device_id.to_string()))?;

            if entry.twin.version != version {
                return Err(RegistryError::VersionConflict {
                    device_id: device_id.to_string(),
                    expected: version,
                    actual: entry.twin.version,
                });
            }

            entry.twin.desired.merge(patch);
            entry.twin.version = entry.twin.version.next();
            entry.subscribers.retain(|tx| !tx.is_closed());
            (entry.twin.version, entry.subscribers.clone())
        };

        debug!(twin = %device_id, version = %new_version, "desired properties updated");

        for tx in subscribers {
            if tx
                .send(CloudNotification::DesiredChanged(patch.clone()))
                .await
                .is_err()
            {
                warn!(twin = %device_id, "subscriber dropped before desired change delivery");
            }
        }

        Ok(new_version)
    }

    async fn subscribe(
        &self,
        device_id: &str,
    ) -> Result<mpsc::Receiver<CloudNotification>, RegistryError> {
        let mut twins = self.twins.lock().await;
        let entry = twins
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::TwinNotFound(device_id.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        entry.subscribers.push(tx);
        info!(twin = %device_id, "device subscribed to twin notifications");
        Ok(rx)
    }
}
