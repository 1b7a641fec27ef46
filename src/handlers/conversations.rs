//! Conversation endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::Result,
    models::{
        AddMembersRequest, CreateGroupRequest, CreatePrivateConversationRequest,
        RemoveMemberRequest, UpdateRoleRequest,
    },
    AppState,
};

use super::{success, success_with_message, Pagination};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub search: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let page = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    let conversations = state
        .conversations
        .list(
            auth.user_id,
            page.limit_or(50),
            page.offset_or_zero(),
            query.search.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(success(serde_json::json!({ "conversations": conversations })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub keyword: Option<String>,
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
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| crate::error::AppError::InvalidArgument("q is required".to_string()))?;

    let page = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    let conversations = state
        .conversations
        .list(auth.user_id, page.limit_or(50), page.offset_or_zero(), &keyword)
        .await?;
    Ok(success(serde_json::json!({ "conversations": conversations })))
}

pub async fn create_private(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreatePrivateConversationRequest>,
) -> Result<Json<Value>> {
    let (conversation, created) = state
        .conversations
        .resolve_or_create_private(auth.user_id, req.user_id)
        .await?;
    let detail = state.conversations.detail(conversation.id, auth.user_id).await?;
    Ok(success(serde_json::json!({
        "conversation": detail,
        "created": created,
    })))
}

pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Value>> {
    let conversation = state
        .conversations
        .create_group(auth.user_id, &req.name, &req.member_ids)
        .await?;
    Ok(success(serde_json::json!({ "conversation": conversation })))
}

pub async fn messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<Json<Value>> {
    let history = state
        .conversations
        .messages(
            auth.user_id,
            conversation_id,
            page.limit_or(50),
            page.offset_or_zero(),
        )
        .await?;
    Ok(success(history))
}

pub async fn hide(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state.conversations.hide(auth.user_id, conversation_id).await?;
    Ok(success_with_message("Conversation hidden", ()))
}

pub async fn add_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<Value>> {
    state
        .conversations
        .add_members(auth.user_id, conversation_id, &req.member_ids)
        .await?;
    Ok(success_with_message("Members added", ()))
}

pub async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<RemoveMemberRequest>,
) -> Result<Json<Value>> {
    state
        .conversations
        .remove_member(auth.user_id, conversation_id, req.user_id)
        .await?;
    Ok(success_with_message("Member removed", ()))
}

pub async fn leave(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state
        .conversations
        .leave_group(auth.user_id, conversation_id)
        .await?;
    Ok(success_with_message("Left conversation", ()))
}

pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((conversation_id, target_user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<Value>> {
    state
        .conversations
        .update_role(auth.user_id, conversation_id, target_user_id, &req.role)
        .await?;
    Ok(success_with_message("Role updated", ()))
}
