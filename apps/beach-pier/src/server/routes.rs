use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::control::FRAMED_SUBPROTOCOL;
use super::relay;
use super::AppState;

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const LAB_HTML: &str = include_str!("../../assets/lab.html");

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/lab", get(lab_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/terminal", get(terminal_handler))
        // Lab pages are served from another port and probe us cross-origin.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn lab_handler() -> Html<&'static str> {
    Html(LAB_HTML)
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthStatus { status: "ok" })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn terminal_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols([FRAMED_SUBPROTOCOL])
        .on_upgrade(move |socket| relay::handle_connection(socket, state))
}
