//! Device discovery: match browsed nodes to registry identities

use regex::Regex;
use tracing::info;

use crate::config::{DeviceBinding, DeviceIdentity};
use crate::error::CoreError;

/// Compile the device name pattern
///
/// # Errors
/// Returns [`CoreError::ConfigError`] for an invalid pattern
pub fn device_pattern(pattern: &str) -> Result<Regex, CoreError> {
    Regex::new(pattern)
        .map_err(|e| CoreError::ConfigError(format!("invalid device pattern {pattern:?}: {e}")))
}

/// Bind each matching node, in browse order, to the identity at the same position
///
/// # Errors
/// Returns [`CoreError::ConfigError`] if no node matches or there are fewer
/// identities than matching nodes
pub fn select_devices(
    browsed: &[String],
    pattern: &Regex,
    identities: &[DeviceIdentity],
) -> Result<Vec<DeviceBinding>, CoreError> {
    let devices: Vec<&String> = browsed.iter().filter(|name| pattern.is_match(name)).collect();

    if devices.is_empty() {
        return Err(CoreError::ConfigError(format!(
            "no machines detected matching {}",
            pattern.as_str()
        )));
    }

    if identities.len() < devices.len() {
        return Err(CoreError::ConfigError(format!(
            "not enough device identities for {} machines, add {} more",
            devices.len(),
            devices.len() - identities.len()
        )));
    }

    let bindings: Vec<DeviceBinding> = devices
        .into_iter()
        .zip(identities)
        .map(|(name, identity)| DeviceBinding::new(name.clone(), identity.device_id.clone()))
        .collect();

    for binding in &bindings {
        info!(device = %binding.device_name, twin = %binding.twin_id, "device discovered");
    }

    Ok(bindings)
}
