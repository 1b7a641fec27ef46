//! Admin settings endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use crate::{auth::AuthUser, error::{AppError, Result}, models::UpdateSettingRequest, AppState};

use super::{success, success_with_message};

pub async fn list(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<Value>> {
    Ok(success(serde_json::json!({ "settings": state.settings.all() })))
}

pub async fn update(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(key): Path<String>,
    Json(req): Json<UpdateSettingRequest>,
) -> Result<Json<Value>> {
    // Feature-flag keys are boolean-valued; numeric limits carry digits.
    let valid = req.value == "true" || req.value == "false" || req.value.parse::<i64>().is_ok();
    if !valid {
        return Err(AppError::InvalidArgument(
            "value must be 'true', 'false' or an integer".to_string(),
        ));
    }

    state.settings.update(&key, &req.value).await?;
    Ok(success(serde_json::json!({
        "key": key,
        "value": req.value,
    })))
}

pub async fn reload(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<Value>> {
    state.settings.reload_all().await?;
    Ok(success_with_message("settings reloaded successfully", ()))
}
