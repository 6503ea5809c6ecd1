//! Error types for fleetlink-transport

use std::time::Duration;

use thiserror::Error;

use fleetlink_api::VersionTag;

/// Errors talking to a device on the field-bus
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Failed to reach the field-bus server
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Device node does not exist
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Attribute does not exist on the device
    #[error("attribute {attribute} not found on {device}")]
    AttributeNotFound {
        /// Device name
        device: String,
        /// Attribute name
        attribute: String,
    },

    /// Device refused a write
    #[error("write to {attribute} rejected: {reason}")]
    WriteRejected {
        /// Attribute name
        attribute: String,
        /// Rejection reason
        reason: String,
    },

    /// Call timed out
    #[error("operation timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Upstream channel failed
    #[error("I/O error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::Timeout { .. }
                | TransportError::IoError(_)
        )
    }
}

/// Errors from the twin registry
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// Device has no twin
    #[error("twin not found: {0}")]
    TwinNotFound(String),

    /// Conditional write lost against a concurrent writer
    #[error("version conflict on {device_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Device identity
        device_id: String,
        /// Version the writer read
        expected: VersionTag,
        /// Version currently stored
        actual: VersionTag,
    },

    /// Registry unreachable
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// Notification channel for a device is gone
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl RegistryError {
    /// Check if error is an optimistic concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::VersionConflict { .. })
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::VersionConflict { .. } | RegistryError::Unavailable(_)
        )
    }
}

/// Errors from the fleet event stream
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Delivery is not in flight (already completed or abandoned)
    #[error("unknown delivery {id} on {topic}")]
    UnknownDelivery {
        /// Topic name
        topic: String,
        /// Delivery id
        id: String,
    },

    /// Stream unreachable
    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

/// Errors delivering an alert
#[derive(Error, Debug, Clone)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    DeliveryFailed(String),
}
