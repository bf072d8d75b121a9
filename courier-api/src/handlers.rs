use axum::{extract::Extension, response::Json};
use serde_json::{json, Value};

use crate::server::ApiState;

/// Liveness plus backlog per priority and transport reachability.
pub async fn health(Extension(state): Extension<ApiState>) -> Json<Value> {
    let transports = state.transports.health().await;
    let status = if transports.values().all(|healthy| *healthy) {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "service": "courier",
        "queue": state.queue.snapshot(),
        "transports": transports,
    }))
}
