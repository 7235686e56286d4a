//! HTTP status surface (axum).
//!
//! Read-only views of the session and group directory, plus a
//! password-gated settings write.

use anyhow::Context;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::task::JoinHandle;

use wxrelay_core::errors::Error;

pub mod handlers;
pub mod router;

pub use router::{build_router, AppState};

/// JSON error reply: `{"error": "..."}` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, "request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Handle returned by [`start`]; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.server.abort();
    }
}

/// Bind `0.0.0.0:{port}` and serve the status surface in the background.
pub async fn start(port: u16, state: AppState) -> anyhow::Result<ServerHandle> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "status surface listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("status surface stopped: {e}");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}
