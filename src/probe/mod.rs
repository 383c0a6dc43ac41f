//! Probe module for uplink reachability checks.
//!
//! A [`Prober`] runs one round of probes against every configured target
//! concurrently. Probe failures never surface as errors: a timeout, a DNS
//! failure or a missing `ping` binary all become `reachable = false`.

mod ping;

pub use ping::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// A single reachability check mechanism.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Probe `address` once and return the measured round-trip time.
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Result of one probe against one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub target: String,
    pub reachable: bool,
    pub rtt_millis: Option<f64>,
}

impl ProbeOutcome {
    pub fn reachable(target: &str, rtt: Duration) -> Self {
        Self {
            target: target.to_string(),
            reachable: true,
            rtt_millis: Some(rtt.as_secs_f64() * 1000.0),
        }
    }

    pub fn unreachable(target: &str) -> Self {
        Self {
            target: target.to_string(),
            reachable: false,
            rtt_millis: None,
        }
    }
}

/// Parse a comma-separated target list.
///
/// Entries are trimmed, blanks dropped and duplicates removed keeping the
/// first occurrence.
pub fn parse_targets(raw: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() || targets.iter().any(|t| t == entry) {
            continue;
        }
        targets.push(entry.to_string());
    }
    targets
}

/// Issues probing rounds over a shared transport.
#[derive(Clone)]
pub struct Prober {
    transport: Arc<dyn ProbeTransport>,
}

impl Prober {
    pub fn new(transport: Arc<dyn ProbeTransport>) -> Self {
        Self { transport }
    }

    /// Prober backed by ICMP echo.
    pub fn icmp() -> Self {
        Self::new(Arc::new(IcmpTransport))
    }

    /// Probe every target concurrently, `probes_per_target` times each.
    ///
    /// Returns one outcome per attempt. The round completes once every target
    /// has answered or timed out; a slow target never delays the others.
    pub async fn probe_all(
        &self,
        targets: &[String],
        timeout: Duration,
        probes_per_target: u32,
    ) -> Vec<ProbeOutcome> {
        let tasks: Vec<_> = targets
            .iter()
            .map(|target| {
                let transport = self.transport.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    probe_target(transport.as_ref(), &target, timeout, probes_per_target).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len() * probes_per_target as usize);
        for (result, target) in join_all(tasks).await.into_iter().zip(targets) {
            match result {
                Ok(target_outcomes) => outcomes.extend(target_outcomes),
                Err(e) => {
                    tracing::error!("Probe task for {} panicked: {}", target, e);
                    outcomes.extend((0..probes_per_target).map(|_| ProbeOutcome::unreachable(target)));
                }
            }
        }
        outcomes
    }
}

/// Run the attempts for one target sequentially.
async fn probe_target(
    transport: &dyn ProbeTransport,
    target: &str,
    timeout: Duration,
    probes: u32,
) -> Vec<ProbeOutcome> {
    let mut outcomes = Vec::with_capacity(probes as usize);
    for _ in 0..probes {
        let outcome = match tokio::time::timeout(timeout, transport.probe(target, timeout)).await {
            Ok(Ok(rtt)) if rtt < timeout => ProbeOutcome::reachable(target, rtt),
            Ok(Ok(_)) | Err(_) => {
                tracing::debug!("Probe to {} timed out after {:?}", target, timeout);
                ProbeOutcome::unreachable(target)
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe to {} failed: {}", target, e);
                ProbeOutcome::unreachable(target)
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
