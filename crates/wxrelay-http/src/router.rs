use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use wxrelay_core::{lifecycle::SessionLifecycle, settings::SettingsStore};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: SessionLifecycle,
    pub settings: Arc<SettingsStore>,
    /// Operator console HTML, read once at startup.
    pub console: Arc<str>,
}

impl AppState {
    pub fn new(
        lifecycle: SessionLifecycle,
        settings: Arc<SettingsStore>,
        console: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            lifecycle,
            settings,
            console: console.into(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::console::index))
        .route("/login-status", get(handlers::status::login_status))
        .route("/groups", get(handlers::status::groups))
        .route("/active-groups", get(handlers::status::active_groups))
        .route("/config", get(handlers::settings::config))
        .route("/verify-password", post(handlers::settings::verify_password))
        .route("/save-config", post(handlers::settings::save_config))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
