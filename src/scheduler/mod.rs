//! Scheduler module driving the two probing cadences.
//!
//! The coarse loop persists one health sample per cycle; the fine loop only
//! republishes the live badge. They share the prober and nothing else, so a
//! slow store write never delays the badge.

use crate::config::ProbeSettings;
use crate::db::{HealthSample, HealthStore};
use crate::health::{aggregate, classify, BadgeReport};
use crate::probe::Prober;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// Orchestrates the coarse (sample) and fine (badge) probing loops.
pub struct Scheduler {
    prober: Prober,
    store: Arc<dyn HealthStore>,
    settings: ProbeSettings,
    badge_tx: watch::Sender<BadgeReport>,
    stop_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(prober: Prober, store: Arc<dyn HealthStore>, settings: ProbeSettings) -> Self {
        let (badge_tx, _) = watch::channel(BadgeReport::pending());
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            prober,
            store,
            settings,
            badge_tx,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Receiver for the latest badge.
    pub fn badge(&self) -> watch::Receiver<BadgeReport> {
        self.badge_tx.subscribe()
    }

    /// Start both loops.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return; // Already running
        }

        tracing::info!(
            "Starting scheduler: {} targets, samples every {:?}, badge every {:?}",
            self.settings.targets.len(),
            self.settings.sample_interval,
            self.settings.badge_interval
        );

        handles.push(tokio::spawn(run_sample_loop(
            self.prober.clone(),
            self.store.clone(),
            self.settings.clone(),
            self.stop_tx.subscribe(),
        )));
        handles.push(tokio::spawn(run_badge_loop(
            self.prober.clone(),
            self.settings.clone(),
            self.badge_tx.clone(),
            self.stop_tx.subscribe(),
        )));
    }

    /// Stop both loops. A round already in flight is allowed to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Probe loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Run one coarse round and persist its sample.
///
/// A failed write is logged and otherwise ignored.
pub async fn sample_once(
    prober: &Prober,
    store: &dyn HealthStore,
    settings: &ProbeSettings,
) -> HealthSample {
    let outcomes = prober
        .probe_all(&settings.targets, settings.timeout, settings.probes_per_target)
        .await;
    let sample = aggregate(&outcomes);

    tracing::info!(
        "Health sample: {} success={}% loss={}% avg={:?}ms",
        sample.status_message,
        sample.success_percentage,
        sample.packet_loss_percentage,
        sample.avg_latency_ms
    );

    if let Err(e) = store.append_sample(&sample) {
        tracing::error!("Failed to store health sample: {}", e);
    }
    sample
}

/// Run one fine round and classify it.
pub async fn badge_once(prober: &Prober, settings: &ProbeSettings) -> BadgeReport {
    let outcomes = prober
        .probe_all(
            &settings.badge_target_list(),
            settings.timeout,
            settings.badge_probes_per_target,
        )
        .await;
    let report = BadgeReport::new(classify(&outcomes), Utc::now());
    tracing::debug!("Internet status badge: {}", report.label);
    report
}

async fn run_sample_loop(
    prober: Prober,
    store: Arc<dyn HealthStore>,
    settings: ProbeSettings,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(settings.sample_interval);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                sample_once(&prober, store.as_ref(), &settings).await;
            }
        }
    }
}

async fn run_badge_loop(
    prober: Prober,
    settings: ProbeSettings,
    badge_tx: watch::Sender<BadgeReport>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(settings.badge_interval);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                let report = badge_once(&prober, &settings).await;
                let previous = badge_tx.send_replace(report.clone()).state;
                if previous != report.state {
                    tracing::info!("Internet status changed: {:?} -> {:?}", previous, report.state);
                }
            }
        }
    }
}
