//! TP-Link Tapo P100-family plug, driven through the `tapo` client.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use ::tapo::{ApiClient, PlugHandler};
use tokio::sync::{Mutex, MutexGuard};

use super::device::{DeviceError, PowerDevice};
use crate::config::DeviceSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Tapo plug addressed by IP, authenticated with the Tapo account.
pub struct TapoPlug {
    name: String,
    ip: String,
    client: ApiClient,
    session: Mutex<Option<PlugHandler>>,
}

impl TapoPlug {
    /// Build a plug from settings; `None` when the address or credentials are missing.
    pub fn from_settings(settings: &DeviceSettings) -> Option<Self> {
        let ip = settings.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let (Some(email), Some(password)) = (&settings.user, &settings.password) else {
            tracing::error!(
                "Tapo plug {} has no account email or password; cannot control it",
                ip
            );
            return None;
        };

        Some(Self {
            name: settings.name.clone(),
            ip: ip.to_string(),
            client: ApiClient::new(email.clone(), password.clone()),
            session: Mutex::new(None),
        })
    }

    /// Lock the session, logging in first if there is none.
    async fn session(&self) -> Result<MutexGuard<'_, Option<PlugHandler>>, DeviceError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            let handler = bounded(self.client.clone().p100(self.ip.clone())).await?;
            *session = Some(handler);
        }
        Ok(session)
    }

    async fn set_power(&self, on: bool) -> Result<(), DeviceError> {
        let mut session = self.session().await?;
        let Some(handler) = session.as_ref() else {
            return Err(DeviceError::Protocol("no Tapo session".to_string()));
        };
        let result = if on {
            bounded(handler.on()).await
        } else {
            bounded(handler.off()).await
        };
        if result.is_err() {
            // Force a fresh login on the next call
            *session = None;
        }
        result
    }
}

async fn bounded<T, F>(request: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, ::tapo::Error>>,
{
    match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DeviceError::Transport(e.to_string())),
        Err(_) => Err(DeviceError::Timeout),
    }
}

#[async_trait]
impl PowerDevice for TapoPlug {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh_session(&self) -> Result<(), DeviceError> {
        let mut session = self.session.lock().await;
        let refreshed = match session.as_mut() {
            Some(handler) => bounded(async { handler.refresh_session().await.map(|_| ()) }).await,
            None => bounded(self.client.clone().p100(self.ip.clone()))
                .await
                .map(|handler| *session = Some(handler)),
        };
        if refreshed.is_err() {
            *session = None;
        }
        refreshed
    }

    async fn turn_off(&self) -> Result<(), DeviceError> {
        self.set_power(false).await
    }

    async fn turn_on(&self) -> Result<(), DeviceError> {
        self.set_power(true).await
    }

    async fn describe(&self) -> Result<Value, DeviceError> {
        let session = self.session().await?;
        match session.as_ref() {
            Some(handler) => bounded(handler.get_device_info_json()).await,
            None => Err(DeviceError::Protocol("no Tapo session".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: Option<&str>, email: Option<&str>) -> DeviceSettings {
        DeviceSettings {
            host: host.map(str::to_string),
            user: email.map(str::to_string),
            password: Some("secret".to_string()),
            name: "nbn".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_address_and_credentials() {
        assert!(TapoPlug::from_settings(&settings(None, Some("me@example.com"))).is_none());
        assert!(TapoPlug::from_settings(&settings(Some(" "), Some("me@example.com"))).is_none());
        assert!(TapoPlug::from_settings(&settings(Some("192.168.1.60"), None)).is_none());

        let plug = TapoPlug::from_settings(&settings(Some(" 192.168.1.60 "), Some("me@example.com")))
            .unwrap();
        assert_eq!(plug.name(), "nbn");
        assert_eq!(plug.ip, "192.168.1.60");
    }

    #[tokio::test]
    async fn test_unreachable_plug_reports_errors() {
        // Port 9 on loopback is almost never listening
        let plug =
            TapoPlug::from_settings(&settings(Some("127.0.0.1:9"), Some("me@example.com"))).unwrap();

        assert!(plug.refresh_session().await.is_err());
        assert!(plug.session.lock().await.is_none());
        assert!(plug.turn_off().await.is_err());
        assert!(plug.describe().await.is_err());
    }
}
