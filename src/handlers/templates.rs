//! Admin notification-template endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::Result,
    models::{CreateTemplateRequest, UpdateTemplateRequest},
    AppState,
};

use super::{success, success_with_message};

pub async fn list(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<Value>> {
    let templates = state.templates.list().await?;
    Ok(success(serde_json::json!({ "templates": templates })))
}

pub async fn create(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<Value>> {
    let template = state.templates.create(&req).await?;
    Ok(success(serde_json::json!({ "template": template })))
}

pub async fn update(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(template_id): Path<Uuid>,
    Json(req): Json<UpdateTemplateRequest>,
) -> Result<Json<Value>> {
    state.templates.update(template_id, &req).await?;
    Ok(success_with_message("Template updated", ()))
}

pub async fn delete(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(template_id): Path<Uuid>,
) -> Result<Json<Value>> {
    state.templates.delete(template_id).await?;
    Ok(success_with_message("Template deleted", ()))
}

pub async fn init_defaults(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<Value>> {
    state.templates.init_defaults().await?;
    Ok(success_with_message("Default templates initialized", ()))
}
