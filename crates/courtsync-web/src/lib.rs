//! JSON status and control API over the sync engine.
//!
//! Read endpoints serve the shared run state (progress, counters, log tail,
//! run history); the write endpoints start a detached run and force-release
//! a stuck run lock.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use courtsync_engine::{RunTrigger, SyncEngine};
use serde::Deserialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "courtsync-web";

pub fn app(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/progress", get(progress_handler))
        .route("/stats", get(stats_handler))
        .route("/logs", get(logs_handler))
        .route("/history", get(history_handler))
        .route("/sync", post(sync_handler))
        .route("/sync/unlock", post(unlock_handler))
        .with_state(engine)
}

pub async fn serve(engine: Arc<SyncEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(engine)).await?;
    Ok(())
}

async fn progress_handler(State(engine): State<Arc<SyncEngine>>) -> Response {
    match engine.progress.view(Utc::now()) {
        Some(view) => Json(view).into_response(),
        None => Json(serde_json::json!({ "status": "idle" })).into_response(),
    }
}

async fn stats_handler(State(engine): State<Arc<SyncEngine>>) -> Response {
    match engine.last_stats() {
        Some(stats) => Json(stats).into_response(),
        None => Json(serde_json::json!({ "status": "no completed runs" })).into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs_handler(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50);
    Json(engine.log.tail(limit)).into_response()
}

async fn history_handler(State(engine): State<Arc<SyncEngine>>) -> Response {
    Json(engine.history.recent()).into_response()
}

async fn sync_handler(State(engine): State<Arc<SyncEngine>>) -> Response {
    match engine.spawn_run(RunTrigger::Manual) {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": run_id })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn unlock_handler(State(engine): State<Arc<SyncEngine>>) -> Response {
    engine.progress.force_clear();
    Json(serde_json::json!({ "status": "unlocked" })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use courtsync_engine::{ClubProfile, StatMapping, SyncConfig};
    use courtsync_source::{FixtureGeocoder, FixtureSourceClient};
    use courtsync_storage::MemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_engine() -> Arc<SyncEngine> {
        let profile = ClubProfile {
            own_club_id: 1234,
            season: "2025/2026".to_string(),
            range_days: 365,
            result_slots: vec!["t".to_string()],
            stat_mapping: StatMapping::new(),
            team_ids: Vec::new(),
            ingest_boxscores: true,
            boxscore_own_teams_only: false,
            logo_ttl_days: 180,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SyncConfig {
            profile,
            assets_dir: dir.keep(),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            stale_lock_secs: 300,
            progress_ttl_secs: 600,
            poll_staleness_secs: 120,
        };
        Arc::new(SyncEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(FixtureSourceClient::new()),
            Arc::new(FixtureGeocoder::default()),
        ))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn progress_reports_idle_without_a_run() {
        let app = app(test_engine());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/progress")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "idle");
    }

    #[tokio::test]
    async fn stats_and_history_start_empty() {
        let engine = test_engine();
        let app = app(engine);

        let stats = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/stats")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(stats.status(), StatusCode::OK);

        let history = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/history")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let json = body_json(history).await;
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn sync_conflicts_while_a_run_is_active() {
        let engine = test_engine();
        engine.progress.try_begin(Utc::now()).expect("claim slot");
        let app = app(engine.clone());

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Force-unlock releases the slot; progress reads idle again.
        let unlock = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync/unlock")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(unlock.status(), StatusCode::OK);

        let progress = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/progress")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let json = body_json(progress).await;
        assert_eq!(json["status"], "idle");
    }

    #[tokio::test]
    async fn logs_tail_respects_limit() {
        let engine = test_engine();
        for i in 0..10 {
            engine.log.info(format!("entry {i}"));
        }
        let app = app(engine);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/logs?limit=3")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let json = body_json(resp).await;
        let entries = json.as_array().expect("array");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2]["message"], "entry 9");
    }
}
