//! Batch user-profile lookup against the user-data agent
//!
//! Lookups enrich API responses only; any failure degrades to an empty map
//! and the response simply omits the profile fields.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct UserData {
    pub name: String,
    pub avatar_url: String,
    pub domain: String,
    pub position: String,
    pub company: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    code: i32,
    data: Option<HashMap<String, UserData>>,
}

#[derive(Clone)]
pub struct UserDataClient {
    http: reqwest::Client,
    base_url: String,
}

impl UserDataClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn batch_get(&self, user_ids: &[Uuid]) -> HashMap<String, UserData> {
        if user_ids.is_empty() {
            return HashMap::new();
        }

        let ids: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        let url = format!("{}/api/v1/user-data/batch", self.base_url);

        let response = match self
            .http
            .post(&url)
            .json(&serde_json::json!({ "user_ids": ids }))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("user-data batch lookup failed: {}", e);
                return HashMap::new();
            }
        };

        if !response.status().is_success() {
            tracing::warn!("user-data agent returned {}", response.status());
            return HashMap::new();
        }

        match response.json::<BatchResponse>().await {
            Ok(body) if body.code == 0 => body.data.unwrap_or_default(),
            Ok(body) => {
                tracing::warn!("user-data agent returned code {}", body.code);
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("user-data response decode failed: {}", e);
                HashMap::new()
            }
        }
    }
}
