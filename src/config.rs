//! Configuration module for netwatchdog.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::probe::parse_targets;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("no probe targets configured")]
    NoTargets,
}

/// Probing configuration shared by both cadences.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub targets: Vec<String>,
    pub timeout: Duration,
    /// Attempts per target in the coarse (persisted) cycle.
    pub probes_per_target: u32,
    /// Attempts per target in the fine (badge) cycle.
    pub badge_probes_per_target: u32,
    /// Number of leading targets used by the fine cycle; `None` means all.
    pub badge_targets: Option<usize>,
    pub sample_interval: Duration,
    pub badge_interval: Duration,
}

impl ProbeSettings {
    /// Targets probed by the fine cycle.
    pub fn badge_target_list(&self) -> Vec<String> {
        match self.badge_targets {
            Some(n) => self.targets.iter().take(n.max(1)).cloned().collect(),
            None => self.targets.clone(),
        }
    }
}

/// Remediation timing and retry configuration.
#[derive(Debug, Clone)]
pub struct RemediationSettings {
    pub cooldown_period: Duration,
    pub power_wait: Duration,
    /// Total power-on attempts, the primary cycle included.
    pub retry_attempts: u32,
    pub cooldown_file: String,
}

impl Default for RemediationSettings {
    fn default() -> Self {
        Self {
            cooldown_period: Duration::from_secs(3600),
            power_wait: Duration::from_secs(30),
            retry_attempts: 3,
            cooldown_file: "cooldown.txt".to_string(),
        }
    }
}

/// Smart plug firmware family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceKind {
    /// TP-Link Tapo plug, credentials are the Tapo account email and password.
    #[default]
    Tapo,
    /// Plug running Tasmota, driven over its HTTP command API.
    Tasmota,
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tapo" => Ok(DeviceKind::Tapo),
            "tasmota" => Ok(DeviceKind::Tasmota),
            other => Err(format!("unknown plug kind {:?}, expected tapo or tasmota", other)),
        }
    }
}

/// Smart plug address and credentials. Opaque to everything but the device adapter.
#[derive(Clone, Default)]
pub struct DeviceSettings {
    pub kind: DeviceKind,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: String,
}

impl std::fmt::Debug for DeviceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSettings")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("name", &self.name)
            .finish()
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the JSON API (default: 8050)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netwatchdog.db")
    pub db_path: String,
    pub probe: ProbeSettings,
    pub remediation: RemediationSettings,
    pub device: DeviceSettings,
}

pub const DEFAULT_TARGETS: &str = "8.8.8.8,1.1.1.1,9.9.9.9";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8050,
            db_path: "netwatchdog.db".to_string(),
            probe: ProbeSettings {
                targets: parse_targets(DEFAULT_TARGETS),
                timeout: Duration::from_millis(1000),
                probes_per_target: 1,
                badge_probes_per_target: 1,
                badge_targets: None,
                sample_interval: Duration::from_secs(60),
                badge_interval: Duration::from_secs(5),
            },
            remediation: RemediationSettings::default(),
            device: DeviceSettings {
                name: "smart plug".to_string(),
                ..Default::default()
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETWATCHDOG_HTTP_PORT`: HTTP port (default: 8050)
    /// - `NETWATCHDOG_DB_PATH`: Database file path (default: "netwatchdog.db")
    /// - `NETWATCHDOG_COOLDOWN_FILE`: Cooldown marker path (default: "cooldown.txt")
    /// - `NETWATCHDOG_TARGETS`: Comma-separated probe targets
    /// - `NETWATCHDOG_PROBE_TIMEOUT_MS`: Per-probe timeout (default: 1000)
    /// - `NETWATCHDOG_PROBES_PER_TARGET`: Coarse-cycle attempts per target (default: 1)
    /// - `NETWATCHDOG_BADGE_PROBES_PER_TARGET`: Fine-cycle attempts per target (default: 1)
    /// - `NETWATCHDOG_BADGE_TARGETS`: Leading targets used by the fine cycle (default: all)
    /// - `NETWATCHDOG_SAMPLE_INTERVAL_SECS`: Coarse cycle (default: 60)
    /// - `NETWATCHDOG_BADGE_INTERVAL_SECS`: Fine cycle (default: 5)
    /// - `NETWATCHDOG_COOLDOWN_SECS`: Remediation cooldown (default: 3600)
    /// - `NETWATCHDOG_POWER_WAIT_SECS`: Off/on dwell (default: 30)
    /// - `NETWATCHDOG_RETRY_ATTEMPTS`: Power-on attempts (default: 3)
    /// - `NETWATCHDOG_PLUG_KIND`: `tapo` (default) or `tasmota`
    /// - `NETWATCHDOG_PLUG_HOST`, `_USER`, `_PASSWORD`, `_NAME`: Smart plug. The
    ///   `TAPO_DEVICE_IP`, `TAPO_EMAIL`, `TAPO_PASSWORD` and `TAPO_DEVICE_NAME`
    ///   variables are read when these are unset.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("NETWATCHDOG_HTTP_PORT") {
            cfg.http_port = parse_number("NETWATCHDOG_HTTP_PORT", &port)?;
        }
        if let Some(db_path) = get("NETWATCHDOG_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(file) = get("NETWATCHDOG_COOLDOWN_FILE") {
            cfg.remediation.cooldown_file = file;
        }

        if let Some(raw) = get("NETWATCHDOG_TARGETS") {
            cfg.probe.targets = parse_targets(&raw);
        }
        if cfg.probe.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        if let Some(v) = get("NETWATCHDOG_PROBE_TIMEOUT_MS") {
            cfg.probe.timeout =
                Duration::from_millis(parse_positive("NETWATCHDOG_PROBE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("NETWATCHDOG_PROBES_PER_TARGET") {
            cfg.probe.probes_per_target = parse_positive("NETWATCHDOG_PROBES_PER_TARGET", &v)?;
        }
        if let Some(v) = get("NETWATCHDOG_BADGE_PROBES_PER_TARGET") {
            cfg.probe.badge_probes_per_target =
                parse_positive("NETWATCHDOG_BADGE_PROBES_PER_TARGET", &v)?;
        }
        if let Some(v) = get("NETWATCHDOG_BADGE_TARGETS") {
            cfg.probe.badge_targets = Some(parse_positive("NETWATCHDOG_BADGE_TARGETS", &v)?);
        }
        if let Some(v) = get("NETWATCHDOG_SAMPLE_INTERVAL_SECS") {
            cfg.probe.sample_interval =
                Duration::from_secs(parse_positive("NETWATCHDOG_SAMPLE_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("NETWATCHDOG_BADGE_INTERVAL_SECS") {
            cfg.probe.badge_interval =
                Duration::from_secs(parse_positive("NETWATCHDOG_BADGE_INTERVAL_SECS", &v)?);
        }

        if let Some(v) = get("NETWATCHDOG_COOLDOWN_SECS") {
            cfg.remediation.cooldown_period =
                Duration::from_secs(parse_number("NETWATCHDOG_COOLDOWN_SECS", &v)?);
        }
        if let Some(v) = get("NETWATCHDOG_POWER_WAIT_SECS") {
            cfg.remediation.power_wait =
                Duration::from_secs(parse_number("NETWATCHDOG_POWER_WAIT_SECS", &v)?);
        }
        if let Some(v) = get("NETWATCHDOG_RETRY_ATTEMPTS") {
            cfg.remediation.retry_attempts = parse_positive("NETWATCHDOG_RETRY_ATTEMPTS", &v)?;
        }

        if let Some(v) = get("NETWATCHDOG_PLUG_KIND") {
            cfg.device.kind = parse_number("NETWATCHDOG_PLUG_KIND", &v)?;
        }
        let plug_var = |key: &str, tapo_key: &str| get(key).or_else(|| get(tapo_key));
        cfg.device.host = plug_var("NETWATCHDOG_PLUG_HOST", "TAPO_DEVICE_IP").map(|h| h.trim().to_string());
        cfg.device.user = plug_var("NETWATCHDOG_PLUG_USER", "TAPO_EMAIL");
        cfg.device.password = plug_var("NETWATCHDOG_PLUG_PASSWORD", "TAPO_PASSWORD");
        if let Some(name) = plug_var("NETWATCHDOG_PLUG_NAME", "TAPO_DEVICE_NAME") {
            cfg.device.name = name;
        }

        Ok(cfg)
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse_number(var, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8050);
        assert_eq!(cfg.db_path, "netwatchdog.db");
        assert_eq!(cfg.probe.targets, vec!["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
        assert_eq!(cfg.probe.timeout, Duration::from_secs(1));
        assert_eq!(cfg.probe.sample_interval, Duration::from_secs(60));
        assert_eq!(cfg.remediation.cooldown_period, Duration::from_secs(3600));
        assert_eq!(cfg.remediation.power_wait, Duration::from_secs(30));
        assert_eq!(cfg.remediation.retry_attempts, 3);
        assert!(cfg.device.host.is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("NETWATCHDOG_TARGETS", " 10.0.0.1, ,10.0.0.1,example.net "),
            ("NETWATCHDOG_PROBES_PER_TARGET", "3"),
            ("NETWATCHDOG_BADGE_TARGETS", "1"),
            ("NETWATCHDOG_COOLDOWN_SECS", "600"),
            ("NETWATCHDOG_PLUG_HOST", "192.168.1.50"),
            ("NETWATCHDOG_PLUG_PASSWORD", "hunter2"),
        ]))
        .unwrap();

        assert_eq!(cfg.probe.targets, vec!["10.0.0.1", "example.net"]);
        assert_eq!(cfg.probe.probes_per_target, 3);
        assert_eq!(cfg.probe.badge_target_list(), vec!["10.0.0.1"]);
        assert_eq!(cfg.remediation.cooldown_period, Duration::from_secs(600));
        assert_eq!(cfg.device.host.as_deref(), Some("192.168.1.50"));
        assert!(!format!("{:?}", cfg.device).contains("hunter2"));
    }

    #[test]
    fn test_plug_settings() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("TAPO_EMAIL", "me@example.com"),
            ("TAPO_PASSWORD", "secret"),
            ("TAPO_DEVICE_IP", "192.168.1.60"),
            ("TAPO_DEVICE_NAME", "nbn"),
        ]))
        .unwrap();
        assert_eq!(cfg.device.kind, DeviceKind::Tapo);
        assert_eq!(cfg.device.host.as_deref(), Some("192.168.1.60"));
        assert_eq!(cfg.device.user.as_deref(), Some("me@example.com"));
        assert_eq!(cfg.device.name, "nbn");

        let cfg = ServerConfig::from_lookup(lookup(&[
            ("NETWATCHDOG_PLUG_KIND", "Tasmota"),
            ("NETWATCHDOG_PLUG_HOST", "10.0.0.9"),
            ("TAPO_DEVICE_IP", "192.168.1.60"),
        ]))
        .unwrap();
        assert_eq!(cfg.device.kind, DeviceKind::Tasmota);
        assert_eq!(cfg.device.host.as_deref(), Some("10.0.0.9"));

        let err = ServerConfig::from_lookup(lookup(&[("NETWATCHDOG_PLUG_KIND", "kasa")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NETWATCHDOG_PLUG_KIND", .. }));
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("NETWATCHDOG_SAMPLE_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NETWATCHDOG_SAMPLE_INTERVAL_SECS", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("NETWATCHDOG_RETRY_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ServerConfig::from_lookup(lookup(&[("NETWATCHDOG_TARGETS", " , ,")])).unwrap_err();
        assert!(matches!(err, ConfigError::NoTargets));
    }
}
