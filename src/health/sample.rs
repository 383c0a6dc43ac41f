//! Coarse-cycle health samples.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use super::{BadgeState, RoundTally};
use crate::db::{HealthRecord, HealthSample};
use crate::probe::ProbeOutcome;

/// Upper bound applied to every latency field of a sample.
pub const MAX_LATENCY_MS: f64 = 500.0;

/// Upper bound applied to packet loss.
pub const MAX_PACKET_LOSS: f64 = 100.0;

/// Aggregate one coarse round into a health sample stamped now.
pub fn aggregate(outcomes: &[ProbeOutcome]) -> HealthSample {
    aggregate_at(outcomes, Utc::now())
}

/// Aggregate one coarse round into a health sample stamped `at`.
///
/// Every attempt counts as one trial, so a target probed twice contributes
/// two. Latency statistics only cover attempts that measured a round-trip
/// time and are clamped after being computed.
pub fn aggregate_at(outcomes: &[ProbeOutcome], at: DateTime<Utc>) -> HealthSample {
    let tally = RoundTally::of(outcomes);

    let (success_percentage, packet_loss_percentage) = if tally.total == 0 {
        (0, 0.0)
    } else {
        let total = tally.total as f64;
        let success = (100.0 * tally.reachable as f64 / total).round() as u8;
        let loss = (100.0 * tally.unreachable() as f64 / total).round();
        (success, loss.clamp(0.0, MAX_PACKET_LOSS))
    };

    let rtts: Vec<f64> = outcomes
        .iter()
        .filter_map(|o| o.rtt_millis)
        .filter(|ms| ms.is_finite())
        .collect();

    let (avg, max, min) = if rtts.is_empty() {
        (None, None, None)
    } else {
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        let max = rtts.iter().copied().fold(f64::MIN, f64::max);
        let min = rtts.iter().copied().fold(f64::MAX, f64::min);
        (Some(avg), Some(max), Some(min))
    };

    HealthSample {
        timestamp: at.trunc_subsecs(0),
        status_message: BadgeState::from_tally(tally).label().to_string(),
        success_percentage,
        avg_latency_ms: avg.map(clamp_latency),
        max_latency_ms: max.map(clamp_latency),
        min_latency_ms: min.map(clamp_latency),
        packet_loss_percentage,
    }
}

fn clamp_latency(ms: f64) -> f64 {
    ms.clamp(0.0, MAX_LATENCY_MS)
}

/// Count of stored samples per connectivity level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleSummary {
    pub fully_up: usize,
    pub partially_up: usize,
    pub down: usize,
    /// Samples whose success value was missing or unreadable.
    pub unknown: usize,
}

/// Summarize stored samples by success level.
pub fn summarize(records: &[HealthRecord]) -> SampleSummary {
    let mut summary = SampleSummary::default();
    for record in records {
        match record.success_percentage {
            Some(pct) if pct >= 100.0 => summary.fully_up += 1,
            Some(pct) if pct > 0.0 => summary.partially_up += 1,
            Some(_) => summary.down += 1,
            None => summary.unknown += 1,
        }
    }
    summary
}
