//! Routes inbound webhook events to registered handlers, optionally after a delay.

pub mod scheduler;

pub use scheduler::{DelayedScheduler, TaskSeq};

use async_trait::async_trait;
use axum::body::Bytes;
use serde_json::Value;
use sitebot_core::PrId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub seq: TaskSeq,
    pub delivery_id: String,
    pub event_name: String,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, dispatch: Dispatch, payload: Arc<Value>);
}

pub struct WebhookRegistration {
    pub event_name: String,
    pub handler: Arc<dyn WebhookHandler>,
    pub delay: Duration,
}

/// An authenticated webhook delivery, still unparsed.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    /// Value of the `X-GitHub-Event` header, if any.
    pub event_name: Option<String>,
    pub delivery_id: String,
    pub body: Bytes,
}

/// Table of listeners built once at startup, then shared read-only.
pub struct EventRouter {
    registrations: Vec<WebhookRegistration>,
    scheduler: Arc<DelayedScheduler>,
}

impl EventRouter {
    pub fn new(scheduler: Arc<DelayedScheduler>) -> Self {
        Self {
            registrations: Vec::new(),
            scheduler,
        }
    }

    pub fn add_listener(
        &mut self,
        event_name: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
        delay: Duration,
    ) -> &mut Self {
        self.registrations.push(WebhookRegistration {
            event_name: event_name.into(),
            handler,
            delay,
        });
        self
    }

    pub fn registrations(&self) -> &[WebhookRegistration] {
        &self.registrations
    }

    /// Schedule every handler registered for the event.
    ///
    /// Returns the number of invocations scheduled. Events nobody listens to,
    /// and bodies that are not JSON, schedule nothing.
    pub fn check_incoming(&self, incoming: IncomingEvent) -> usize {
        let Some(event_name) = incoming.event_name else {
            info!(
                delivery = %incoming.delivery_id,
                "Ignoring webhook without an event type header"
            );
            return 0;
        };

        let matching: Vec<&WebhookRegistration> = self
            .registrations
            .iter()
            .filter(|registration| registration.event_name == event_name)
            .collect();

        if matching.is_empty() {
            debug!("No listeners for {} event", event_name);
            return 0;
        }

        let payload: Value = match serde_json::from_slice(&incoming.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    delivery = %incoming.delivery_id,
                    "Ignoring {} event with malformed JSON: {}",
                    event_name,
                    e
                );
                return 0;
            }
        };

        let key = pr_key(&payload);
        let payload = Arc::new(payload);

        for registration in &matching {
            let handler = Arc::clone(&registration.handler);
            let payload = Arc::clone(&payload);
            let span = info_span!(
                "webhook",
                delivery = %incoming.delivery_id,
                event = %event_name,
                pr = key.map(|pr| pr.0),
            );
            let delivery_id = incoming.delivery_id.clone();
            let dispatched_event = event_name.clone();

            let seq = self.scheduler.schedule(key, registration.delay, move |seq| {
                async move {
                    let dispatch = Dispatch {
                        seq,
                        delivery_id,
                        event_name: dispatched_event,
                    };
                    handler.handle(dispatch, payload).await;
                }
                .instrument(span)
            });

            debug!(
                "Scheduled {} handler {} in {:?}",
                event_name, seq, registration.delay
            );
        }

        matching.len()
    }
}

/// Pull request (or issue) number the payload is about.
fn pr_key(payload: &Value) -> Option<PrId> {
    payload
        .get("number")
        .or_else(|| payload.pointer("/pull_request/number"))
        .or_else(|| payload.pointer("/issue/number"))
        .and_then(Value::as_u64)
        .map(PrId)
}
