//! HTTP and WebSocket request handlers

pub mod conversations;
pub mod health;
pub mod messages;
pub mod notifications;
pub mod relationships;
pub mod settings;
pub mod templates;
pub mod websocket;

use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// Success envelope: `{code: 0, message: "success", data: ...}`.
pub fn success(data: impl Serialize) -> Json<Value> {
    Json(json!({
        "code": 0,
        "message": "success",
        "data": data,
    }))
}

pub fn success_with_message(message: &str, data: impl Serialize) -> Json<Value> {
    Json(json!({
        "code": 0,
        "message": message,
        "data": data,
    }))
}

/// Common `limit`/`offset` query parameters.
#[derive(Debug, serde::Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub fn limit_or(&self, default: i64) -> i64 {
        self.limit.filter(|&l| l > 0).unwrap_or(default)
    }

    pub fn offset_or_zero(&self) -> i64 {
        self.offset.filter(|&o| o >= 0).unwrap_or(0)
    }
}
