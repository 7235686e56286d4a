use axum::{
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use wxrelay_core::{errors::Error, settings::RelaySettings};

use crate::{router::AppState, ApiError};

pub async fn config(State(state): State<AppState>) -> Json<RelaySettings> {
    Json(state.settings.current().await)
}

#[derive(Deserialize)]
struct PasswordBody {
    password: String,
}

#[derive(Serialize)]
struct VerifyReply {
    success: bool,
    message: &'static str,
}

/// Check a candidate password without changing anything.
pub async fn verify_password(State(state): State<AppState>, body: Bytes) -> Response {
    let req: PasswordBody = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return ApiError::bad_request(format!("invalid request body: {e}")).into_response(),
    };

    match state.settings.verify(&req.password) {
        Ok(true) => Json(VerifyReply {
            success: true,
            message: "password verified",
        })
        .into_response(),
        Ok(false) => Json(VerifyReply {
            success: false,
            message: "wrong password",
        })
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SaveQuery {
    #[serde(default)]
    password: String,
}

/// Replace `blockedGroups`. The password is checked before the body is read.
pub async fn save_config(
    State(state): State<AppState>,
    Query(query): Query<SaveQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if !state.settings.verify(&query.password)? {
        tracing::warn!("save-config rejected: wrong password");
        return Err(Error::Unauthorized("wrong password".to_string()).into());
    }

    let update: RelaySettings = serde_json::from_slice(&body).map_err(Error::from)?;
    state
        .settings
        .replace_blocked_groups(&query.password, update.blocked_groups)
        .await?;

    Ok(Json(json!({ "success": true })))
}
