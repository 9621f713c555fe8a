pub mod builder;
pub mod commands;
pub mod comments;
pub mod config;
pub mod dispatch;
pub mod github;
pub mod handlers;
pub mod instances;
pub mod payload;
pub mod reaper;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod webhook;

use axum::{http::StatusCode, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use dispatch::{DelayedScheduler, EventRouter};
use instances::InstanceManager;

pub use github::GitHubClient;

pub struct AppState {
    pub webhook_secret: String,
    pub router: Arc<EventRouter>,
    pub manager: Arc<InstanceManager>,
    pub scheduler: Arc<DelayedScheduler>,
    pub status_auth_token: Option<String>,
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// The HTTP surface: liveness, status and the authenticated webhook route.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/status", get(status::status_handler))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
