//! Message endpoints: recall and search

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{auth::AuthUser, error::Result, models::ServerFrame, AppState};

use super::{success, success_with_message, Pagination};

pub async fn recall(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Value>> {
    // The conversation is resolved before the recall so the broadcast
    // audience is known even though the row is about to change.
    let message = state.messages.get_message(message_id).await?;
    state.messages.recall(auth.user_id, message_id).await?;

    let frame = ServerFrame::Recalled { message_id };
    match state.messages.member_ids(message.conversation_id).await {
        Ok(member_ids) => {
            for member_id in member_ids {
                state.hub.broadcast_frame(member_id, &frame).await;
            }
        }
        Err(e) => tracing::error!("Failed to resolve recall audience: {}", e),
    }

    Ok(success_with_message("Message recalled successfully", ()))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub keyword: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn search(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>> {
    let keyword = query
        .q
        .or(query.keyword)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            crate::error::AppError::InvalidArgument("q or keyword is required".to_string())
        })?;

    let page = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    let messages = state
        .messages
        .search(
            auth.user_id,
            &keyword,
            query.conversation_id,
            page.limit_or(50),
            page.offset_or_zero(),
        )
        .await?;
    Ok(success(serde_json::json!({ "messages": messages })))
}
