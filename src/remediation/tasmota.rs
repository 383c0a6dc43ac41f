//! Smart plug running Tasmota firmware, driven over its HTTP command API.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::device::{DeviceError, PowerDevice};
use crate::config::DeviceSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Tasmota plug addressed by host (optionally `host:port`).
pub struct TasmotaPlug {
    name: String,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    client: Mutex<reqwest::Client>,
}

impl TasmotaPlug {
    /// Build a plug from settings; `None` when no host is configured.
    pub fn from_settings(settings: &DeviceSettings) -> Result<Option<Self>, DeviceError> {
        let Some(host) = settings.host.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(None);
        };
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };

        Ok(Some(Self {
            name: settings.name.clone(),
            base_url,
            user: settings.user.clone(),
            password: settings.password.clone(),
            client: Mutex::new(build_client()?),
        }))
    }

    fn client(&self) -> reqwest::Client {
        match self.client.lock() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run one console command and return the JSON reply.
    async fn command(&self, cmnd: &str) -> Result<Value, DeviceError> {
        let mut query = vec![("cmnd", cmnd)];
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            query.push(("user", user.as_str()));
            query.push(("password", password.as_str()));
        }

        let response = self
            .client()
            .get(format!("{}/cm", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeviceError::Timeout
                } else {
                    DeviceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DeviceError::Auth(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(DeviceError::Transport(format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DeviceError::Protocol(e.to_string()))?;
        if let Some(warning) = body.get("WARNING").and_then(Value::as_str) {
            return Err(DeviceError::Auth(warning.to_string()));
        }
        Ok(body)
    }

    async fn set_power(&self, on: bool) -> Result<(), DeviceError> {
        let wanted = if on { "ON" } else { "OFF" };
        let body = self.command(&format!("Power {}", wanted)).await?;
        let state = body
            .get("POWER")
            .or_else(|| body.get("POWER1"))
            .and_then(Value::as_str);
        match state {
            Some(s) if s.eq_ignore_ascii_case(wanted) => Ok(()),
            other => Err(DeviceError::Protocol(format!(
                "expected POWER={} but got {:?}",
                wanted, other
            ))),
        }
    }
}

fn build_client() -> Result<reqwest::Client, DeviceError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| DeviceError::Transport(e.to_string()))
}

#[async_trait]
impl PowerDevice for TasmotaPlug {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh_session(&self) -> Result<(), DeviceError> {
        // Drop pooled connections that may have gone stale, then confirm access
        let fresh = build_client()?;
        match self.client.lock() {
            Ok(mut client) => *client = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        self.command("Status").await.map(|_| ())
    }

    async fn turn_off(&self) -> Result<(), DeviceError> {
        self.set_power(false).await
    }

    async fn turn_on(&self) -> Result<(), DeviceError> {
        self.set_power(true).await
    }

    async fn describe(&self) -> Result<Value, DeviceError> {
        self.command("Status 0").await
    }
}
