//! Values exchanged with the collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use fleetlink_api::{
    AttributeValue, CloudMessage, CommandRequest, CommandResponse, DesiredProperties,
    MessageDisposition,
};

/// Acknowledgment returned by a device operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationAck {
    /// Output arguments of the operation
    pub outputs: Vec<AttributeValue>,
}

/// Notification pushed from the registry to a device
#[derive(Debug)]
pub enum CloudNotification {
    /// Desired properties changed; carries the changed properties only
    DesiredChanged(DesiredProperties),
    /// Cloud-to-device message awaiting a disposition
    Message {
        message: CloudMessage,
        reply: oneshot::Sender<MessageDisposition>,
    },
    /// Direct command awaiting a response
    Command {
        request: CommandRequest,
        reply: oneshot::Sender<CommandResponse>,
    },
}

/// Message handed out by an [`EventStream`](crate::traits::EventStream)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Delivery identifier, stable across redeliveries
    pub id: String,
    /// Topic the message was published on
    pub topic: String,
    /// JSON body
    pub body: String,
    /// Number of times the message has been handed out
    pub delivery_count: u32,
    /// Time the message was first published
    pub enqueued_at: DateTime<Utc>,
}
