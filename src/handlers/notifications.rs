//! Notification endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthUser, error::Result, models::BatchSendNotificationRequest, AppState,
};

use super::{success, success_with_message, Pagination};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
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
    let notifications = state
        .notifications
        .list(
            auth.user_id,
            page.limit_or(20),
            page.offset_or_zero(),
            query.unread_only,
        )
        .await?;
    let summary = state.notifications.summary(auth.user_id).await?;
    Ok(success(serde_json::json!({
        "notifications": notifications,
        "unread_count": summary.unread_count,
    })))
}

/// Detail view; reading an unread notification marks it read.
pub async fn detail(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Value>> {
    let notification = state.notifications.detail(auth.user_id, notification_id).await?;
    Ok(success(serde_json::json!({ "notification": notification })))
}

pub async fn mark_all_read(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>> {
    state.notifications.mark_all_read(auth.user_id).await?;

    let summary = state.notifications.summary(auth.user_id).await?;
    state
        .hub
        .send_notification_update(auth.user_id, summary.unread_count, summary.latest_notif_time)
        .await;

    Ok(success_with_message("All notifications marked as read", ()))
}

pub async fn delete(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state.notifications.delete(auth.user_id, notification_id).await?;

    let summary = state.notifications.summary(auth.user_id).await?;
    state
        .hub
        .send_notification_update(auth.user_id, summary.unread_count, summary.latest_notif_time)
        .await;

    Ok(success_with_message("Notification deleted", ()))
}

/// Admin: render a template once and deliver to a list of users.
pub async fn batch_send(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(req): Json<BatchSendNotificationRequest>,
) -> Result<Json<Value>> {
    let sent = state
        .notifications
        .batch_send_with_template(
            &req.user_ids,
            &req.template_type,
            &req.template_vars,
            req.metadata.as_ref(),
        )
        .await?;
    Ok(success(serde_json::json!({ "sent": sent })))
}
