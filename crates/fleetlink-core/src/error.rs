//! Core error types for fleetlink-core

use thiserror::Error;

use fleetlink_transport::{RegistryError, StreamError, TransportError};

/// Errors that can occur in agents, the policy engine and the router
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Device not managed by the supervisor
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device already managed by the supervisor
    #[error("device already registered: {0}")]
    DeviceAlreadyExists(String),

    /// Supervisor has no device to poll
    #[error("no devices registered")]
    NoDevices,

    /// Device returned an attribute vector that cannot be interpreted
    #[error("malformed reading: {0}")]
    MalformedReading(String),

    /// Fleet message body could not be parsed
    #[error("malformed event on {topic}: {reason}")]
    MalformedEvent {
        /// Topic the message arrived on
        topic: String,
        /// Parser error
        reason: String,
    },

    /// No handler registered for a topic
    #[error("no route for topic: {0}")]
    UnknownTopic(String),

    /// Field-bus failure
    #[error("device transport error: {0}")]
    Transport(#[from] TransportError),

    /// Twin registry failure
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Event stream failure
    #[error("event stream error: {0}")]
    Stream(#[from] StreamError),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CoreError {
    /// Check if error is transient and the operation may succeed on a later cycle
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Transport(e) => e.is_retryable(),
            CoreError::Registry(e) => e.is_retryable(),
            CoreError::Stream(_) => true,
            _ => false,
        }
    }
}
