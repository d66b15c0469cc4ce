use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime_seconds = state.started_at.elapsed().as_secs();
    let active_conversations = state.engine.active_conversations();
    let pending_batch_groups = state.batches.pending_groups().await;
    match state.catalog.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "uptime_seconds": uptime_seconds,
            "checked_at": Utc::now(),
            "active_conversations": active_conversations,
            "pending_batch_groups": pending_batch_groups,
            "catalog": stats,
        })),
        Err(e) => {
            tracing::warn!(error = %e, "catalog stats failed during health check");
            Json(serde_json::json!({
                "status": "degraded",
                "uptime_seconds": uptime_seconds,
                "checked_at": Utc::now(),
                "active_conversations": active_conversations,
            "pending_batch_groups": pending_batch_groups,
                "error": e.to_string(),
            }))
        }
    }
}
