use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse},
};

use crate::router::AppState;

pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Html(state.console.to_string()),
    )
}
