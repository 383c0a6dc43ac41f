//! Cooldown-gated power-cycle state machine.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::cooldown::{Clock, CooldownMarker, RunLease};
use super::device::{DeviceError, PowerDevice};
use crate::config::RemediationSettings;
use crate::db::{HealthStore, RemediationEvent};

/// Default reason for runs triggered by an external downtime monitor.
pub const AUTO_REASON: &str = "Internet down for 5+ minutes";

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Phases of one remediation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemediationPhase {
    Idle,
    CooldownCheck,
    ActingOff,
    Waiting,
    ActingOn,
    Verifying,
    Retrying,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemediationOutcome {
    /// The device was powered off and back on.
    Completed,
    /// Nothing was touched: cooldown active or another run in progress.
    Skipped,
    /// The device could not be cycled, or could not be confirmed back on.
    Failed,
}

/// Final result of a remediation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationReport {
    pub outcome: RemediationOutcome,
    /// Power-on attempts made, the primary cycle included.
    pub attempts: u32,
    pub detail: Option<String>,
}

impl RemediationReport {
    fn completed(attempts: u32) -> Self {
        Self {
            outcome: RemediationOutcome::Completed,
            attempts,
            detail: None,
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            outcome: RemediationOutcome::Skipped,
            attempts: 0,
            detail: Some(detail.into()),
        }
    }

    fn failed(attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            outcome: RemediationOutcome::Failed,
            attempts,
            detail: Some(detail.into()),
        }
    }
}

/// Reachability of the power device, as shown next to the manual control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device: Option<String>,
    pub configured: bool,
    /// `None` while a run owns the device and it was not checked.
    pub connected: Option<bool>,
    pub run_active: bool,
    pub detail: Option<String>,
}

/// Externally visible view of the active run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub device: String,
    pub reason: String,
    pub phase: RemediationPhase,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// In-memory state of one run. Clears the published snapshot when dropped.
struct RemediationRun {
    snapshot: RunSnapshot,
    slot: Arc<Mutex<Option<RunSnapshot>>>,
}

impl RemediationRun {
    fn start(
        device: &str,
        reason: &str,
        started_at: DateTime<Utc>,
        slot: Arc<Mutex<Option<RunSnapshot>>>,
    ) -> Self {
        let run = Self {
            snapshot: RunSnapshot {
                device: device.to_string(),
                reason: reason.to_string(),
                phase: RemediationPhase::Idle,
                attempt: 0,
                started_at,
            },
            slot,
        };
        run.publish();
        run
    }

    fn enter(&mut self, phase: RemediationPhase) {
        tracing::info!(
            device = %self.snapshot.device,
            attempt = self.snapshot.attempt,
            "Remediation phase {:?} -> {:?}",
            self.snapshot.phase,
            phase
        );
        self.snapshot.phase = phase;
        self.publish();
    }

    fn next_attempt(&mut self) -> u32 {
        self.snapshot.attempt += 1;
        self.snapshot.attempt
    }

    fn attempts(&self) -> u32 {
        self.snapshot.attempt
    }

    fn publish(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(self.snapshot.clone());
        }
    }
}

impl Drop for RemediationRun {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

struct ControllerInner {
    device: Option<Arc<dyn PowerDevice>>,
    store: Arc<dyn HealthStore>,
    cooldown: CooldownMarker,
    clock: Arc<dyn Clock>,
    settings: RemediationSettings,
    run_lock: Arc<AsyncMutex<()>>,
    active: Arc<Mutex<Option<RunSnapshot>>>,
}

/// Serialised entry point for power-cycling the upstream equipment.
///
/// Cheap to clone; clones share the same device, lock and cooldown marker.
#[derive(Clone)]
pub struct RemediationController {
    inner: Arc<ControllerInner>,
}

impl RemediationController {
    pub fn new(
        device: Option<Arc<dyn PowerDevice>>,
        store: Arc<dyn HealthStore>,
        clock: Arc<dyn Clock>,
        settings: RemediationSettings,
    ) -> Self {
        // A lease outliving any plausible run belongs to a dead process
        let lease_ttl = settings
            .power_wait
            .saturating_mul(2)
            .saturating_add(Duration::from_secs(600));
        let cooldown = CooldownMarker::new(&settings.cooldown_file, lease_ttl);
        Self {
            inner: Arc::new(ControllerInner {
                device,
                store,
                cooldown,
                clock,
                settings,
                run_lock: Arc::new(AsyncMutex::new(())),
                active: Arc::new(Mutex::new(None)),
            }),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.device.is_some()
    }

    /// Snapshot of the run in progress, if any.
    pub fn active_run(&self) -> Option<RunSnapshot> {
        self.inner.active.lock().ok().and_then(|slot| slot.clone())
    }

    /// Power-cycle the device unless a cooldown or another run prevents it.
    ///
    /// With `bypass_cooldown` the cooldown gate is skipped; runs are still
    /// serialised. The run executes on its own task, so dropping the returned
    /// future never leaves the device switched off.
    pub async fn remediate(&self, reason: &str, bypass_cooldown: bool) -> RemediationReport {
        let Some(device) = self.inner.device.clone() else {
            tracing::error!("Remediation requested ({}) but no power device is configured", reason);
            return RemediationReport::failed(0, "device not configured");
        };

        let guard = match self.inner.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("Remediation requested ({}) while another run is active", reason);
                return RemediationReport::skipped("run in progress");
            }
        };

        let inner = self.inner.clone();
        let reason = reason.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run(device, &reason, bypass_cooldown).await
        });

        match task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Remediation task aborted: {}", e);
                RemediationReport::failed(0, format!("remediation task aborted: {}", e))
            }
        }
    }

    /// Like [`remediate`](Self::remediate), but when `shutdown` resolves first
    /// the run is still awaited to a terminal phase before returning.
    pub async fn remediate_through_shutdown<F>(
        &self,
        reason: &str,
        bypass_cooldown: bool,
        shutdown: F,
    ) -> RemediationReport
    where
        F: Future<Output = ()>,
    {
        let run = self.remediate(reason, bypass_cooldown);
        tokio::pin!(run);
        tokio::select! {
            report = &mut run => report,
            _ = shutdown => {
                tracing::warn!("Shutdown requested; finishing the remediation run first");
                run.await
            }
        }
    }

    /// Check whether the power device answers a session refresh.
    ///
    /// The check is skipped while a run owns the device.
    pub async fn device_status(&self) -> DeviceStatus {
        let Some(device) = self.inner.device.as_ref() else {
            return DeviceStatus {
                device: None,
                configured: false,
                connected: Some(false),
                run_active: false,
                detail: Some("device not configured".to_string()),
            };
        };

        if self.active_run().is_some() {
            return DeviceStatus {
                device: Some(device.name().to_string()),
                configured: true,
                connected: None,
                run_active: true,
                detail: Some("run in progress".to_string()),
            };
        }

        let checked = tokio::time::timeout(STATUS_TIMEOUT, device.refresh_session()).await;
        let detail = match checked {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(DeviceError::Timeout.to_string()),
        };
        if let Some(detail) = &detail {
            tracing::warn!("{} is not reachable: {}", device.name(), detail);
        }
        DeviceStatus {
            device: Some(device.name().to_string()),
            configured: true,
            connected: Some(detail.is_none()),
            run_active: false,
            detail,
        }
    }

    /// Wait until no run is active.
    pub async fn wait_idle(&self) {
        let _guard = self.inner.run_lock.lock().await;
    }
}

impl ControllerInner {
    async fn run(
        &self,
        device: Arc<dyn PowerDevice>,
        reason: &str,
        bypass_cooldown: bool,
    ) -> RemediationReport {
        let mut run =
            RemediationRun::start(device.name(), reason, self.clock.now(), self.active.clone());

        run.enter(RemediationPhase::CooldownCheck);
        let _lease = match self.check_gate(bypass_cooldown) {
            Ok(lease) => lease,
            Err(report) => {
                run.enter(RemediationPhase::Done);
                return report;
            }
        };

        // Primary cycle: refresh, off, dwell, on
        run.enter(RemediationPhase::ActingOff);
        let mut powered_off = false;
        let mut powered_on = false;
        match refresh_and_switch(device.as_ref(), false).await {
            Ok(()) => {
                powered_off = true;
                tracing::info!("{} has been turned off", device.name());

                run.enter(RemediationPhase::Waiting);
                tokio::time::sleep(self.settings.power_wait).await;

                run.next_attempt();
                run.enter(RemediationPhase::ActingOn);
                match device.turn_on().await {
                    Ok(()) => powered_on = true,
                    Err(e) => tracing::warn!("Power on of {} failed: {}", device.name(), e),
                }
            }
            Err(e) => tracing::warn!("Power off of {} failed: {}", device.name(), e),
        }

        while !powered_on && run.attempts() < self.settings.retry_attempts {
            let attempt = run.next_attempt();
            run.enter(RemediationPhase::Retrying);
            tracing::warn!(
                "Refreshing session and retrying power on of {} (attempt {}/{})",
                device.name(),
                attempt,
                self.settings.retry_attempts
            );
            match refresh_and_switch(device.as_ref(), true).await {
                Ok(()) => {
                    powered_on = true;
                    tracing::info!("{} turned back on after attempt {}", device.name(), attempt);
                }
                Err(e) => tracing::error!("Retry attempt {} failed: {}", attempt, e),
            }
        }

        let attempts = run.attempts();
        if !powered_on {
            run.enter(RemediationPhase::Failed);
            tracing::error!(
                "All {} power-on attempts for {} failed; the device may be left off",
                attempts,
                device.name()
            );
            self.log_event(&format!("{} (failed)", reason));
            return RemediationReport::failed(attempts, "device could not be powered on");
        }

        run.enter(RemediationPhase::Verifying);
        match device.describe().await {
            Ok(info) => tracing::info!("Device info for {}: {}", device.name(), info),
            Err(e) => tracing::warn!("Failed to retrieve device info for {}: {}", device.name(), e),
        }

        if !powered_off {
            // Device is on, but it was never cycled
            run.enter(RemediationPhase::Failed);
            self.log_event(&format!("{} (failed)", reason));
            return RemediationReport::failed(attempts, "power off failed; device confirmed on");
        }

        run.enter(RemediationPhase::Done);
        if let Err(e) = self.cooldown.record(self.clock.now()) {
            tracing::error!("Failed to update cooldown marker: {}", e);
        }
        self.log_event(reason);
        RemediationReport::completed(attempts)
    }

    /// Take the run lease and apply the cooldown rule while holding it.
    fn check_gate(&self, bypass_cooldown: bool) -> Result<RunLease, RemediationReport> {
        let now = self.clock.now();
        let lease = match self.cooldown.try_lease(now) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!("Another process holds the remediation lease, skipping");
                return Err(RemediationReport::skipped("run in progress"));
            }
            Err(e) => {
                tracing::error!("Cannot take remediation lease: {}", e);
                return Err(RemediationReport::failed(0, e.to_string()));
            }
        };

        if bypass_cooldown {
            tracing::info!("Cooldown bypassed by operator override");
            return Ok(lease);
        }

        match self.cooldown.remaining(now, self.settings.cooldown_period) {
            Ok(None) => Ok(lease),
            Ok(Some(left)) => {
                tracing::info!(
                    "Cooldown period is still active, skipping power cycle. Time left: {} seconds",
                    left
                );
                Err(RemediationReport::skipped(format!("cooldown active for {}s", left)))
            }
            Err(e) => {
                tracing::error!("Cannot read cooldown marker: {}", e);
                Err(RemediationReport::failed(0, e.to_string()))
            }
        }
    }

    fn log_event(&self, reason: &str) {
        let event = RemediationEvent {
            timestamp: self.clock.now(),
            reason: reason.to_string(),
        };
        match self.store.append_event(&event) {
            Ok(()) => tracing::info!("Power cycle event logged: {}", reason),
            Err(e) => tracing::error!("Failed to log power cycle event: {}", e),
        }
    }
}

/// Refresh the device session, then switch power.
async fn refresh_and_switch(device: &dyn PowerDevice, on: bool) -> Result<(), DeviceError> {
    device.refresh_session().await?;
    if on {
        device.turn_on().await
    } else {
        device.turn_off().await
    }
}
