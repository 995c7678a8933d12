use axum::response::Json;
use serde_json::{json, Value};

/// Liveness probe.
pub fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "API server is running",
    }))
}
