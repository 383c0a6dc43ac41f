//! Power device capability consumed by the remediation controller.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::{TapoPlug, TasmotaPlug};
use crate::config::{DeviceKind, DeviceSettings};

/// Device error types. The controller only tells success from failure.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device request timed out")]
    Timeout,
    #[error("device rejected credentials: {0}")]
    Auth(String),
    #[error("device unreachable: {0}")]
    Transport(String),
    #[error("unexpected device response: {0}")]
    Protocol(String),
}

/// A remotely switchable power outlet feeding the upstream equipment.
#[async_trait]
pub trait PowerDevice: Send + Sync {
    /// Human readable device name used in logs.
    fn name(&self) -> &str;

    /// Re-establish the control session; a stale session is the usual cause of failures.
    async fn refresh_session(&self) -> Result<(), DeviceError>;

    async fn turn_off(&self) -> Result<(), DeviceError>;

    async fn turn_on(&self) -> Result<(), DeviceError>;

    /// Diagnostic information about the device.
    async fn describe(&self) -> Result<serde_json::Value, DeviceError>;
}

/// Build the configured power device, or `None` when none is configured.
pub fn connect_device(settings: &DeviceSettings) -> Result<Option<Arc<dyn PowerDevice>>, DeviceError> {
    let device: Option<Arc<dyn PowerDevice>> = match settings.kind {
        DeviceKind::Tapo => TapoPlug::from_settings(settings).map(|plug| Arc::new(plug) as _),
        DeviceKind::Tasmota => TasmotaPlug::from_settings(settings)?.map(|plug| Arc::new(plug) as _),
    };
    Ok(device)
}
