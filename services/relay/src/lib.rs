pub mod ban;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod processor;
pub mod session;
pub mod store;
pub mod validator;
pub mod ws;

use axum::extract::{FromRef, MatchedPath, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;

use metrics::Metrics;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub ws: ws::WsState,
    pub metrics: Arc<Metrics>,
    pub store: Arc<Store>,
}

impl FromRef<AppState> for ws::WsState {
    fn from_ref(state: &AppState) -> Self {
        state.ws.clone()
    }
}

impl FromRef<AppState> for Arc<Metrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[must_use]
pub fn build_router(state: AppState, ws_path: &str, metrics_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws::upgrade))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route(metrics_path, get(metrics_handler))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state.metrics.clone(), track_http_metrics))
}

async fn track_http_metrics(State(metrics): State<Arc<Metrics>>, req: Request, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics.http_requests.inc();
    metrics.http_request_duration.observe(started.elapsed().as_secs_f64());
    if response.status().is_server_error() {
        metrics.errors.with_label_values(&[path.as_str()]).inc();
    }
    response
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.encode(),
    )
}

mod health {
    use super::AppState;
    use crate::error::json_error;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
        match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
            Ok(_) => (StatusCode::OK, "ok").into_response(),
            Err(e) => {
                state.metrics.errors.with_label_values(&["readyz"]).inc();
                json_error(StatusCode::SERVICE_UNAVAILABLE, "db_unreachable", e.to_string()).into_response()
            }
        }
    }
}
