//! HTTP surface: router assembly plus the history, cleanup and health handlers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::ApiError;
use crate::history::{HistoryParams, HistoryQuery};
use crate::retention::{purge_older_than, CleanupParams, CleanupReport};
use crate::state::AppState;
use crate::types::{now_ms, Point};
use crate::ws::ws_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/history", get(history_handler))
        .route("/metrics", delete(cleanup_handler))
        .route("/health", get(health_handler))
        .fallback(not_found)
        .with_state(state)
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Point>>, ApiError> {
    let query = HistoryQuery::from_params(&params, now_ms())?;
    let points = query
        .run(&state.store)
        .await
        .map_err(|source| ApiError::Store {
            context: "Database query failed",
            source,
        })?;
    Ok(Json(points))
}

async fn cleanup_handler(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<CleanupReport>, ApiError> {
    let report = purge_older_than(&state.store, params.max_age_ms(), now_ms())
        .await
        .map_err(|source| ApiError::Store {
            context: "Cleanup failed",
            source,
        })?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMemory {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub timestamp: String,
    pub host: String,
    pub clients: usize,
    pub uptime_secs: u64,
    pub memory: ProcessMemory,
}

fn process_memory() -> ProcessMemory {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return ProcessMemory::default();
    };
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid)
        .map(|p| ProcessMemory {
            rss_bytes: p.memory(),
            virtual_bytes: p.virtual_memory(),
        })
        .unwrap_or_default()
}

async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    let memory = tokio::task::spawn_blocking(process_memory)
        .await
        .unwrap_or_default();
    Json(Health {
        status: "OK".to_string(),
        timestamp: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        host: state.hostname.clone(),
        clients: state.sessions.live_count().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
        memory,
    })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Endpoint not found" })),
    )
}
