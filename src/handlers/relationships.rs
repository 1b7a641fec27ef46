//! Relationship (blocking) endpoints

use axum::{extract::State, Json};
use serde_json::Value;

use crate::{auth::AuthUser, error::Result, models::BlockUserRequest, AppState};

use super::{success, success_with_message};

pub async fn block(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<BlockUserRequest>,
) -> Result<Json<Value>> {
    state
        .relationships
        .block_user(auth.user_id, req.target_user_id)
        .await?;
    Ok(success_with_message("User blocked", ()))
}

pub async fn unblock(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<BlockUserRequest>,
) -> Result<Json<Value>> {
    state
        .relationships
        .unblock_user(auth.user_id, req.target_user_id)
        .await?;
    Ok(success_with_message("User unblocked", ()))
}

pub async fn blocked(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>> {
    let relationships = state.relationships.blocked_users(auth.user_id).await?;
    Ok(success(serde_json::json!({ "blocked": relationships })))
}

/// Clears presence and disconnects every device of the caller.
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>> {
    state.hub.force_offline(auth.user_id).await;
    Ok(success_with_message("Logged out", ()))
}
