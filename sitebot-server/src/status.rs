//! `GET /status`: a JSON snapshot of live instances.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sitebot_core::{InstanceRecord, InstanceState};
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct InstanceStatus {
    pub pr_number: u64,
    pub branch: String,
    pub source_repo: String,
    pub author: String,
    pub ports: String,
    pub link: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_deployed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub free_ports: usize,
    pub pending_tasks: usize,
    pub instances: Vec<InstanceStatus>,
}

impl InstanceStatus {
    fn from_record(record: InstanceRecord, link: String) -> Self {
        Self {
            pr_number: record.pr_id().0,
            branch: record.data.branch,
            source_repo: record.data.source_repo_full_name,
            author: record.data.pr_author,
            ports: record.ports.to_string(),
            link,
            state: record.state,
            created_at: record.created_at,
            last_deployed_at: record.last_deployed_at,
        }
    }
}

/// Validate the authorization header against the status auth token.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    // If no auth token is configured, the endpoint is disabled
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Status endpoint is disabled (STATUS_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(provided_token) if provided_token == expected_token => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing or malformed Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;

    let registry = state.manager.registry();
    let composer = state.manager.composer();
    let instances = registry
        .list()
        .await
        .into_iter()
        .map(|record| {
            let link = composer.preview_link(&record);
            InstanceStatus::from_record(record, link)
        })
        .collect();

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        free_ports: registry.free_ports().await,
        pending_tasks: state.scheduler.pending_count(),
        instances,
    }))
}
