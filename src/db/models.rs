//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate over one coarse probing round, as written to `internet_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub status_message: String,
    /// 0-100
    pub success_percentage: u8,
    /// `None` when no probe in the round measured a round-trip time.
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub packet_loss_percentage: f64,
}

/// A health sample read back from the store.
///
/// Every numeric column is optional: values that are missing, malformed or
/// out of range come back as `None` rather than zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status_message: Option<String>,
    pub success_percentage: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub packet_loss_percentage: Option<f64>,
}

/// One remediation attempt that reached the device, as written to `power_cycle_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Preset query windows offered by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DateRange {
    #[default]
    #[serde(rename = "last_12_hours")]
    Last12Hours,
    #[serde(rename = "last_24_hours")]
    Last24Hours,
    #[serde(rename = "last_48_hours")]
    Last48Hours,
    #[serde(rename = "last_7_days")]
    Last7Days,
    #[serde(rename = "all_time")]
    AllTime,
}

impl DateRange {
    /// Lower bound of the window ending at `now`, or `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = match self {
            DateRange::Last12Hours => chrono::Duration::hours(12),
            DateRange::Last24Hours => chrono::Duration::hours(24),
            DateRange::Last48Hours => chrono::Duration::hours(48),
            DateRange::Last7Days => chrono::Duration::days(7),
            DateRange::AllTime => return None,
        };
        Some(now - span)
    }
}
