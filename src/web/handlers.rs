//! HTTP request handlers.
//!
//! Read endpoints degrade to empty results when the store is unavailable; the
//! dashboard consuming them renders gaps rather than errors.

use super::AppState;
use crate::db::{DateRange, HealthRecord, RemediationEvent};
use crate::health::{summarize, BadgeReport, SampleSummary};
use crate::remediation::{DeviceStatus, RemediationReport, RunSnapshot, AUTO_REASON};

use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub range: DateRange,
}

fn load_samples(state: &AppState, range: DateRange) -> Vec<HealthRecord> {
    match state.store.query_health_samples(range.since(Utc::now())) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Failed to load health samples: {}", e);
            Vec::new()
        }
    }
}

pub async fn handle_get_samples(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Json<Vec<HealthRecord>> {
    Json(load_samples(&state, query.range))
}

pub async fn handle_get_summary(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Json<SampleSummary> {
    Json(summarize(&load_samples(&state, query.range)))
}

pub async fn handle_get_events(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Json<Vec<RemediationEvent>> {
    let since = query.range.since(Utc::now());
    match state.store.query_remediation_events(since, None) {
        Ok(events) => Json(events),
        Err(e) => {
            tracing::warn!("Failed to load remediation events: {}", e);
            Json(Vec::new())
        }
    }
}

// ============================================================================
// API: Live status
// ============================================================================

pub async fn handle_get_badge(State(state): State<AppState>) -> Json<BadgeReport> {
    Json(state.badge.borrow().clone())
}

pub async fn handle_get_remediation(State(state): State<AppState>) -> Json<Option<RunSnapshot>> {
    Json(state.controller.active_run())
}

/// Whether the power device currently answers; gates the manual control.
pub async fn handle_get_device(State(state): State<AppState>) -> Json<DeviceStatus> {
    Json(state.controller.device_status().await)
}

// ============================================================================
// API: Remediation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RemediateRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "override")]
    pub override_cooldown: bool,
}

/// Run one remediation. Only `application/json` bodies are accepted.
pub async fn handle_remediate(
    State(state): State<AppState>,
    Json(req): Json<RemediateRequest>,
) -> Json<RemediationReport> {
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| default_reason(req.override_cooldown).to_string());

    Json(
        state
            .controller
            .remediate(&reason, req.override_cooldown)
            .await,
    )
}

/// Reason recorded when the caller supplies none.
pub fn default_reason(override_cooldown: bool) -> &'static str {
    if override_cooldown {
        "override"
    } else {
        AUTO_REASON
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemediationSettings, ServerConfig};
    use crate::db::{DbError, HealthSample, HealthStore, Store};
    use crate::health::BadgeState;
    use crate::remediation::{
        DeviceError, PowerDevice, RemediationController, RemediationOutcome, SystemClock,
    };
    use crate::web::Server;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;

    /// Store whose every call fails.
    struct BrokenStore;

    impl HealthStore for BrokenStore {
        fn append_sample(&self, _: &HealthSample) -> Result<(), DbError> {
            Err(DbError::Poisoned)
        }
        fn append_event(&self, _: &RemediationEvent) -> Result<(), DbError> {
            Err(DbError::Poisoned)
        }
        fn query_health_samples(&self, _: Option<DateTime<Utc>>) -> Result<Vec<HealthRecord>, DbError> {
            Err(DbError::Poisoned)
        }
        fn query_remediation_events(
            &self,
            _: Option<DateTime<Utc>>,
            _: Option<DateTime<Utc>>,
        ) -> Result<Vec<RemediationEvent>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    /// Plug whose session check follows a switch.
    struct FakePlug {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl PowerDevice for FakePlug {
        fn name(&self) -> &str {
            "fake plug"
        }
        async fn refresh_session(&self) -> Result<(), DeviceError> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DeviceError::Transport("connection refused".to_string()))
            }
        }
        async fn turn_off(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn turn_on(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn describe(&self) -> Result<Value, DeviceError> {
            Ok(json!({}))
        }
    }

    fn state_with(store: Arc<dyn HealthStore>, dir: &TempDir) -> (AppState, watch::Sender<BadgeReport>) {
        state_with_device(None, store, dir)
    }

    fn state_with_device(
        device: Option<Arc<dyn PowerDevice>>,
        store: Arc<dyn HealthStore>,
        dir: &TempDir,
    ) -> (AppState, watch::Sender<BadgeReport>) {
        let settings = RemediationSettings {
            cooldown_file: dir.path().join("cooldown.txt").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let controller = RemediationController::new(device, store.clone(), Arc::new(SystemClock), settings);
        let (badge_tx, badge) = watch::channel(BadgeReport::pending());
        let state = AppState {
            config: ServerConfig::default(),
            store,
            controller,
            badge,
        };
        (state, badge_tx)
    }

    fn sample_at(at: DateTime<Utc>, success: u8, message: &str) -> HealthSample {
        HealthSample {
            timestamp: at,
            status_message: message.to_string(),
            success_percentage: success,
            avg_latency_ms: Some(20.0),
            max_latency_ms: Some(30.0),
            min_latency_ms: Some(10.0),
            packet_loss_percentage: 100.0 - success as f64,
        }
    }

    #[test]
    fn test_range_query_parsing() {
        let q: RangeQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(q.range, DateRange::Last12Hours);
        let q: RangeQuery = serde_json::from_value(json!({"range": "last_7_days"})).unwrap();
        assert_eq!(q.range, DateRange::Last7Days);
    }

    #[test]
    fn test_default_reason() {
        assert_eq!(default_reason(false), AUTO_REASON);
        assert_eq!(default_reason(true), "override");
    }

    #[tokio::test]
    async fn test_samples_respect_range() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("test.db")).unwrap());
        let now = Utc::now();
        store
            .append_sample(&sample_at(now - chrono::Duration::hours(30), 0, "Internet: Down"))
            .unwrap();
        store
            .append_sample(&sample_at(now - chrono::Duration::hours(1), 100, "Internet: Up"))
            .unwrap();
        let (state, _badge_tx) = state_with(store, &dir);

        let Json(recent) = handle_get_samples(
            State(state.clone()),
            Query(RangeQuery { range: DateRange::Last12Hours }),
        )
        .await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status_message.as_deref(), Some("Internet: Up"));

        let Json(summary) = handle_get_summary(
            State(state),
            Query(RangeQuery { range: DateRange::Last48Hours }),
        )
        .await;
        assert_eq!(summary.fully_up, 1);
        assert_eq!(summary.down, 1);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let (state, _badge_tx) = state_with(Arc::new(BrokenStore), &dir);

        let Json(samples) = handle_get_samples(State(state.clone()), Query(RangeQuery::default())).await;
        assert!(samples.is_empty());
        let Json(events) = handle_get_events(State(state.clone()), Query(RangeQuery::default())).await;
        assert!(events.is_empty());
        let Json(summary) = handle_get_summary(State(state), Query(RangeQuery::default())).await;
        assert_eq!(summary, SampleSummary::default());
    }

    #[tokio::test]
    async fn test_badge_and_idle_remediation() {
        let dir = tempdir().unwrap();
        let (state, badge_tx) = state_with(Arc::new(BrokenStore), &dir);

        let Json(badge) = handle_get_badge(State(state.clone())).await;
        assert_eq!(badge.state, BadgeState::Unknown);

        badge_tx.send_replace(BadgeReport::new(BadgeState::PartiallyUp, Utc::now()));
        let Json(badge) = handle_get_badge(State(state.clone())).await;
        assert_eq!(badge.label, "Internet: Partially Up");

        let Json(active) = handle_get_remediation(State(state)).await;
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn test_device_status_follows_session_check() {
        let dir = tempdir().unwrap();
        let plug = Arc::new(FakePlug {
            reachable: AtomicBool::new(true),
        });
        let (state, _badge_tx) = state_with_device(Some(plug.clone()), Arc::new(BrokenStore), &dir);

        let Json(status) = handle_get_device(State(state.clone())).await;
        assert!(status.configured);
        assert_eq!(status.device.as_deref(), Some("fake plug"));
        assert_eq!(status.connected, Some(true));
        assert!(status.detail.is_none());

        plug.reachable.store(false, Ordering::SeqCst);
        let Json(status) = handle_get_device(State(state)).await;
        assert_eq!(status.connected, Some(false));
        assert!(status.detail.unwrap().contains("connection refused"));

        let (unconfigured, _badge_tx) = state_with(Arc::new(BrokenStore), &dir);
        let Json(status) = handle_get_device(State(unconfigured)).await;
        assert!(!status.configured);
        assert_eq!(status.connected, Some(false));
    }

    #[tokio::test]
    async fn test_router_serves_json() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("test.db")).unwrap());
        let (state, _badge_tx) = state_with(store.clone(), &dir);
        let server = Server::new(state.config, store.clone(), state.controller, state.badge);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server.routes();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let bad_range = client
            .get(format!("{}/api/samples?range=forever", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_range.status(), reqwest::StatusCode::BAD_REQUEST);

        // No device configured: the run fails without touching anything
        let badge = client
            .get(format!("{}/api/badge", base))
            .header("origin", "http://dashboard.example")
            .send()
            .await
            .unwrap();
        assert_eq!(badge.headers()["access-control-allow-origin"], "*");

        let device: Value = client
            .get(format!("{}/api/device", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(device["configured"], false);

        // A cross-site form post carries no JSON content type
        let form = client
            .post(format!("{}/api/remediate", base))
            .header("origin", "http://evil.example")
            .header("content-type", "text/plain")
            .body(r#"{"override":true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(form.status(), reqwest::StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(form.headers().get("access-control-allow-origin").is_none());
        assert!(store.query_remediation_events(None, None).unwrap().is_empty());

        // No device configured: the run fails without touching anything
        let response = client
            .post(format!("{}/api/remediate", base))
            .header("origin", "http://evil.example")
            .json(&json!({"override": true}))
            .send()
            .await
            .unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
        let report: Value = response.json().await.unwrap();
        assert_eq!(report["outcome"], json!(RemediationOutcome::Failed));
        assert_eq!(report["detail"], "device not configured");

        let malformed = client
            .post(format!("{}/api/remediate", base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
