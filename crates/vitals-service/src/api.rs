//! HTTP control surface.
//!
//! Three endpoints per the control contract: `GET /health` (liveness plus a
//! static config echo), `GET /status` (per-site freshness and backfill
//! progress), and `POST /trigger` (start/continue/reset a sync, backfill,
//! or archival job). Responses always carry an `errors` array; partial
//! progress is reported, never hidden.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use vitals_store::StateStore;
use vitals_types::{BackfillState, Freshness};

use crate::archive::{ArchivalEngine, ArchiveReport};
use crate::backfill::{BackfillEngine, BackfillError};
use crate::freshness::FreshnessMonitor;
use crate::state::AppState;
use crate::sync::{SyncOrchestrator, SyncReport};

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/trigger", post(trigger))
}

/// Error response: a status code and a JSON `{"error": ...}` body.
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.1 }));
        (self.0, body).into_response()
    }
}

impl From<BackfillError> for AppError {
    fn from(e: BackfillError) -> Self {
        match e {
            BackfillError::MissingRange | BackfillError::InvalidRange(_) => {
                AppError(StatusCode::BAD_REQUEST, e.to_string())
            }
            BackfillError::Store(_) | BackfillError::State(_) => {
                AppError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<vitals_store::Error> for AppError {
    fn from(e: vitals_store::Error) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Static limits this deployment runs with.
    pub config: ConfigEcho,
}

/// The effective static limits, echoed for operators.
#[derive(Debug, Serialize)]
pub struct ConfigEcho {
    pub window_cap_minutes: u64,
    pub max_sites_per_run: usize,
    pub target_lag_secs: i64,
    pub backfill_pages_per_run: u32,
    pub retention_days: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        config: ConfigEcho {
            window_cap_minutes: state.config.sync.window_cap_minutes,
            max_sites_per_run: state.config.sync.max_sites_per_run,
            target_lag_secs: state.config.sync.target_lag_secs,
            backfill_pages_per_run: state.config.backfill.pages_per_run,
            retention_days: state.config.archive.retention_days,
        },
    })
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    site: String,
}

/// Freshness of a site's hot data.
#[derive(Debug, Serialize)]
pub struct FreshnessInfo {
    /// Data age in seconds; `None` when the site has no data.
    pub age_seconds: Option<i64>,
    pub level: Freshness,
}

/// Backfill progress, shaped for polling callers.
#[derive(Debug, Serialize)]
pub struct ProgressInfo {
    pub current_date: String,
    pub completed_dates: Vec<String>,
    pub percent: f64,
    pub samples_fetched: u64,
}

impl ProgressInfo {
    fn from_state(state: &BackfillState) -> Self {
        Self {
            current_date: state.current_date.to_string(),
            completed_dates: state.completed_dates.iter().map(|d| d.to_string()).collect(),
            percent: state.percent(),
            samples_fetched: state.samples_fetched,
        }
    }
}

/// Per-site status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub site: String,
    /// Backfill status, or `idle` when no backfill exists for the site.
    pub status: String,
    pub freshness: FreshnessInfo,
    /// Incremental sync cursor, ms since the epoch.
    pub last_sync_ts: Option<i64>,
    pub progress: Option<ProgressInfo>,
    pub errors: Vec<String>,
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, AppError> {
    let monitor = FreshnessMonitor::new(&state.config.sync);
    let store = state.store.lock().await;

    let age_seconds = monitor.age_secs(&store, &params.site)?;
    let level = monitor.classify(&store, &params.site)?;
    let sync_state = store.sync_state(&params.site)?;
    let backfill = store.backfill_state(&params.site)?;

    Ok(Json(StatusResponse {
        site: params.site,
        status: backfill
            .as_ref()
            .map_or("idle", |b| b.status.as_str())
            .to_string(),
        freshness: FreshnessInfo { age_seconds, level },
        last_sync_ts: sync_state.map(|s| s.last_sync_ts),
        progress: backfill.as_ref().map(ProgressInfo::from_state),
        errors: backfill.map(|b| b.errors).unwrap_or_default(),
    }))
}

/// Trigger request body.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    /// One of `sync`, `backfill`, `archive`.
    pub job: String,
    /// Site, required for backfill.
    pub site: Option<String>,
    /// Backfill range start, `YYYY-MM-DD`.
    pub start_date: Option<String>,
    /// Backfill range end, `YYYY-MM-DD`.
    pub end_date: Option<String>,
    /// Discard existing backfill progress and start over.
    #[serde(default)]
    pub reset: bool,
}

/// Trigger response.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: String,
    /// Whether the job wants to be triggered again.
    pub continuation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressInfo>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveReport>,
}

async fn trigger(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    match request.job.as_str() {
        "sync" => {
            let report = SyncOrchestrator::new(state).run().await;
            Ok(Json(TriggerResponse {
                status: if report.lock_acquired { "ok" } else { "locked_out" }.to_string(),
                continuation: false,
                progress: None,
                errors: report
                    .sites
                    .iter()
                    .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {}", s.site, e)))
                    .collect(),
                sync: Some(report),
                archive: None,
            }))
        }
        "backfill" => {
            let site = request.site.as_deref().ok_or_else(|| {
                AppError(StatusCode::BAD_REQUEST, "missing required parameter: site".to_string())
            })?;
            let range = parse_range(&request)?;

            let outcome = BackfillEngine::new(state)
                .trigger(site, range, request.reset)
                .await?;

            Ok(Json(TriggerResponse {
                status: outcome.state.status.as_str().to_string(),
                continuation: outcome.continuation(),
                progress: Some(ProgressInfo::from_state(&outcome.state)),
                errors: outcome.state.errors.clone(),
                sync: None,
                archive: None,
            }))
        }
        "archive" => {
            let report = ArchivalEngine::new(state).run().await;
            Ok(Json(TriggerResponse {
                status: "ok".to_string(),
                continuation: false,
                progress: None,
                errors: report.errors.clone(),
                sync: None,
                archive: Some(report),
            }))
        }
        other => Err(AppError(
            StatusCode::BAD_REQUEST,
            format!("unknown job '{other}': expected sync, backfill, or archive"),
        )),
    }
}

fn parse_range(request: &TriggerRequest) -> Result<Option<(time::Date, time::Date)>, AppError> {
    let format = format_description!("[year]-[month]-[day]");
    let parse = |field: &str, value: &str| {
        time::Date::parse(value, &format).map_err(|e| {
            AppError(
                StatusCode::BAD_REQUEST,
                format!("invalid {field} '{value}': {e}"),
            )
        })
    };

    match (&request.start_date, &request.end_date) {
        (Some(start), Some(end)) => Ok(Some((
            parse("start_date", start)?,
            parse("end_date", end)?,
        ))),
        (None, None) => Ok(None),
        _ => Err(AppError(
            StatusCode::BAD_REQUEST,
            "start_date and end_date must be provided together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::ScriptedApi;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vitals_cold::MemoryStore;
    use vitals_store::Store;
    use vitals_types::Sample;

    fn test_app(api: ScriptedApi, config: Config) -> Router {
        let state = AppState::new(
            Store::open_in_memory().unwrap(),
            Arc::new(MemoryStore::new()),
            Arc::new(api),
            config,
        );
        router().with_state(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_trigger(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/trigger")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_echoes_config() {
        let mut config = Config::default();
        config.archive.retention_days = 14;
        let app = test_app(ScriptedApi::new(vec![]), config);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["config"]["retention_days"], 14);
        assert_eq!(json["config"]["max_sites_per_run"], 6);
    }

    #[tokio::test]
    async fn test_status_requires_site() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_for_unknown_site_is_idle_and_urgent() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(Request::get("/status?site=hq").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "idle");
        assert_eq!(json["freshness"]["level"], "urgent");
        assert!(json["progress"].is_null());
        assert_eq!(json["errors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_trigger_unknown_job_is_rejected() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(post_trigger(serde_json::json!({"job": "compact"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("unknown job"));
    }

    #[tokio::test]
    async fn test_trigger_backfill_requires_site() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(post_trigger(serde_json::json!({"job": "backfill"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_backfill_rejects_half_open_range() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(post_trigger(serde_json::json!({
                "job": "backfill",
                "site": "hq",
                "start_date": "2024-12-10"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_backfill_runs_to_completion() {
        let day = time::macros::date!(2024 - 12 - 10);
        let ts = day.midnight().assume_utc().unix_timestamp() * 1000 + 1000;
        let api = ScriptedApi::new(vec![
            Ok(ScriptedApi::page(vec![Sample::new("hq", "p", ts, 1.0)], Some("c1"))),
            Ok(ScriptedApi::page(vec![Sample::new("hq", "p", ts + 1000, 2.0)], None)),
        ]);
        let app = test_app(api, Config::default());

        let response = app
            .oneshot(post_trigger(serde_json::json!({
                "job": "backfill",
                "site": "hq",
                "start_date": "2024-12-10",
                "end_date": "2024-12-10"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "complete");
        assert_eq!(json["continuation"], false);
        assert_eq!(json["progress"]["completed_dates"], serde_json::json!(["2024-12-10"]));
        assert_eq!(json["progress"]["percent"], 100.0);
        assert_eq!(json["progress"]["samples_fetched"], 2);
    }

    #[tokio::test]
    async fn test_trigger_sync_reports_results() {
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let api = ScriptedApi::new(vec![Ok(ScriptedApi::page(
            vec![Sample::new("hq", "p", now_ms, 1.0)],
            None,
        ))]);
        let mut config = Config::default();
        config.sites = vec!["hq".to_string()];
        config.sync.catchup_max_cycles = 0;
        let app = test_app(api, config);

        let response = app
            .oneshot(post_trigger(serde_json::json!({"job": "sync"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sync"]["sites"][0]["written"], 1);
        assert_eq!(json["errors"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_trigger_archive_runs() {
        let app = test_app(ScriptedApi::new(vec![]), Config::default());
        let response = app
            .oneshot(post_trigger(serde_json::json!({"job": "archive"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["archive"]["partitions_archived"], 0);
    }
}
