//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Append-only time-series persistence for the probe and remediation engine.
///
/// Reads are best effort: a corrupt value surfaces as a missing field, never
/// as an error or a zero.
pub trait HealthStore: Send + Sync {
    fn append_sample(&self, sample: &HealthSample) -> Result<(), DbError>;

    fn append_event(&self, event: &RemediationEvent) -> Result<(), DbError>;

    /// Samples at or after `since`, ascending by timestamp.
    fn query_health_samples(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HealthRecord>, DbError>;

    /// Events within `[since, until)`, ascending by timestamp.
    fn query_remediation_events(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemediationEvent>, DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        // Readers (the API) and the writer loop share the file
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}

impl HealthStore for Store {
    fn append_sample(&self, sample: &HealthSample) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO internet_status (timestamp, status, success_percentage, avg_latency_ms, max_latency_ms, min_latency_ms, packet_loss)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_db_time(sample.timestamp),
                sample.status_message,
                sample.success_percentage,
                sample.avg_latency_ms,
                sample.max_latency_ms,
                sample.min_latency_ms,
                sample.packet_loss_percentage,
            ],
        )?;
        Ok(())
    }

    fn append_event(&self, event: &RemediationEvent) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO power_cycle_events (timestamp, reason) VALUES (?1, ?2)",
            params![format_db_time(event.timestamp), event.reason],
        )?;
        Ok(())
    }

    fn query_health_samples(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HealthRecord>, DbError> {
        let (sql, bounds) = range_query(SAMPLES_SELECT, since, None);
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(bounds.iter()), |row| {
                    Ok((
                        row.get::<_, Value>(0)?,
                        row.get::<_, Value>(1)?,
                        row.get::<_, Value>(2)?,
                        row.get::<_, Value>(3)?,
                        row.get::<_, Value>(4)?,
                        row.get::<_, Value>(5)?,
                        row.get::<_, Value>(6)?,
                    ))
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let mut skipped = 0usize;
        let records: Vec<HealthRecord> = rows
            .into_iter()
            .filter_map(|(ts, status, success, avg, max, min, loss)| {
                let Some(timestamp) = coerce_time(ts) else {
                    skipped += 1;
                    return None;
                };
                Some(HealthRecord {
                    timestamp,
                    status_message: coerce_text(status),
                    success_percentage: coerce_bounded(success, 100.0),
                    avg_latency_ms: coerce_bounded(avg, crate::health::MAX_LATENCY_MS),
                    max_latency_ms: coerce_bounded(max, crate::health::MAX_LATENCY_MS),
                    min_latency_ms: coerce_bounded(min, crate::health::MAX_LATENCY_MS),
                    packet_loss_percentage: coerce_bounded(loss, crate::health::MAX_PACKET_LOSS),
                })
            })
            .collect();

        if skipped > 0 {
            tracing::warn!("Skipped {} health samples with unreadable timestamps", skipped);
        }
        Ok(records)
    }

    fn query_remediation_events(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemediationEvent>, DbError> {
        let (sql, bounds) = range_query(EVENTS_SELECT, since, until);
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(bounds.iter()), |row| Ok((row.get::<_, Value>(0)?, row.get::<_, Value>(1)?)))?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let events: Vec<RemediationEvent> = rows
            .into_iter()
            .filter_map(|(ts, reason)| {
                Some(RemediationEvent {
                    timestamp: coerce_time(ts)?,
                    reason: coerce_text(reason).unwrap_or_default(),
                })
            })
            .collect();
        Ok(events)
    }
}

const SAMPLES_SELECT: &str = "SELECT timestamp, status, success_percentage, avg_latency_ms, max_latency_ms, min_latency_ms, packet_loss FROM internet_status";

const EVENTS_SELECT: &str = "SELECT timestamp, reason FROM power_cycle_events";

/// Append a `[since, until)` timestamp filter and ascending order to `select`.
///
/// Rows are written in a fixed-width UTC format, so text comparison on the
/// indexed column matches chronological order.
fn range_query(
    select: &str,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut bounds = Vec::new();
    if let Some(since) = since {
        bounds.push(format_db_time(since));
        conditions.push(format!("timestamp >= ?{}", bounds.len()));
    }
    if let Some(until) = until {
        bounds.push(format_db_time(until));
        conditions.push(format!("timestamp < ?{}", bounds.len()));
    }

    let mut sql = select.to_string();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY timestamp ASC");
    (sql, bounds)
}

/// Format a timestamp the way every row is written: RFC 3339, UTC, whole seconds.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    None
}

fn coerce_time(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Text(s) => parse_db_time(&s),
        Value::Integer(secs) => DateTime::from_timestamp(secs, 0),
        _ => None,
    }
}

fn coerce_text(value: Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        _ => None,
    }
}

/// Read a numeric column, treating anything unparseable or outside `[0, max]` as missing.
fn coerce_bounded(value: Value, max: f64) -> Option<f64> {
    let n = match value {
        Value::Integer(i) => i as f64,
        Value::Real(f) => f,
        Value::Text(s) => s.trim().parse::<f64>().ok()?,
        Value::Null | Value::Blob(_) => return None,
    };
    (n.is_finite() && (0.0..=max).contains(&n)).then_some(n)
}
