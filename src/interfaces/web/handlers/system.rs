//! Liveness and client-compatibility endpoints.

use axum::Json;
use chrono::Utc;

use crate::interfaces::web::schemas::MODEL_ID;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// A single fixed model so OpenAI-compatible clients can list and select it.
pub async fn list_models() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": MODEL_ID,
            "object": "model",
            "created": Utc::now().timestamp(),
            "owned_by": MODEL_ID,
        }]
    }))
}
