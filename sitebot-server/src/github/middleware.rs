use axum::http;
use reqwest::header::HeaderValue;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Logs every outbound GitHub call and tags it with a request id.
pub struct TracingMiddleware;

#[async_trait::async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        // Keep a caller-provided id, otherwise generate one
        let request_id = match req.headers().get(REQUEST_ID_HEADER) {
            Some(existing) => existing.to_str().unwrap_or_default().to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                id
            }
        };

        let method = req.method().clone();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let response = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &response {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                debug!(
                    request_id = %request_id,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "GitHub {} {}",
                    method,
                    path
                );
            }
            Ok(resp) => {
                warn!(
                    request_id = %request_id,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "GitHub {} {} returned an error status",
                    method,
                    path
                );
            }
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    elapsed_ms,
                    "GitHub {} {} failed: {}",
                    method,
                    path,
                    err
                );
            }
        }

        response
    }
}
