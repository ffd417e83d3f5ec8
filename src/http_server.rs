//! HTTP server implementation using Axum.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use futures_util::TryStreamExt;
use std::io;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::gateway::{self, ExecutionRequest};
use crate::state::AppState;

/// Build the router for `/status` and `/vgrind`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/vgrind", any(vgrind))
        // Input is truncated by the gateway, never rejected for size.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> &'static str {
    state.readiness.state().as_str()
}

async fn vgrind(State(state): State<AppState>, method: Method, body: Body) -> Response {
    if !state.readiness.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready\n").into_response();
    }
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "expected POST\n").into_response();
    }

    let input = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let request = ExecutionRequest::new(Box::pin(input), state.limits.timeout);

    debug!("Waiting for admission");
    match gateway::execute(&state, request).await {
        Some(output) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(output),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "admission closed\n").into_response(),
    }
}
