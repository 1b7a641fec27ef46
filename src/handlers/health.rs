//! Health check

use axum::Json;
use serde_json::{json, Value};

use super::success;

pub async fn health_check() -> Json<Value> {
    success(json!({ "status": "ok" }))
}
