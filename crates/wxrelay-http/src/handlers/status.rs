use axum::{extract::State, http::header, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use wxrelay_core::{
    domain::GroupInfo,
    lifecycle::{Phase, StatusSnapshot},
};

use crate::{router::AppState, ApiError};

const NOT_STARTED: &str = "session provider is still starting, retry shortly";

/// `/login-status` body. `error` is only set before the first provider exists.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatus {
    pub is_logged: bool,
    pub qr_code_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub phase: Phase,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl From<StatusSnapshot> for LoginStatus {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            is_logged: s.is_active,
            qr_code_url: s.challenge_url.unwrap_or_default(),
            error: (!s.provider_started).then(|| NOT_STARTED.to_string()),
            phase: s.phase,
            failure_count: s.failure_count,
            cooldown_until: s.cooldown_until,
            account: s.account,
        }
    }
}

pub async fn login_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = LoginStatus::from(state.lifecycle.snapshot().await);
    (
        [(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate")],
        Json(status),
    )
}

/// Force a refresh through the live session and return what it listed.
pub async fn groups(State(state): State<AppState>) -> Result<Json<Vec<GroupInfo>>, ApiError> {
    let groups = state.lifecycle.refresh_directory().await?;
    Ok(Json(groups))
}

pub async fn active_groups(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.lifecycle.directory().snapshot().await.sorted_ids())
}
