//! Webhook handlers registered with the [`EventRouter`](crate::dispatch::EventRouter).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sitebot_core::PrAction;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commands::CommandProcessor;
use crate::dispatch::{Dispatch, WebhookHandler};
use crate::instances::InstanceManager;
use crate::payload::{IssueCommentEvent, PullRequestEvent};

/// `pull_request`: opened, reopened, synchronize and closed drive the lifecycle.
pub struct PullRequestHandler {
    manager: Arc<InstanceManager>,
}

impl PullRequestHandler {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl WebhookHandler for PullRequestHandler {
    async fn handle(&self, dispatch: Dispatch, payload: Arc<Value>) {
        let event = match PullRequestEvent::deserialize(payload.as_ref()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed pull_request payload: {}", e);
                return;
            }
        };

        let Some(action) = PrAction::parse(&event.action) else {
            debug!(
                "Ignoring pull_request action {} for PR #{}",
                event.action, event.number
            );
            return;
        };

        info!(
            "Valid hook received: {} for PR #{} ({})",
            event.action, event.number, dispatch.seq
        );

        self.manager
            .handle_pull_request(dispatch.seq, action, event.instance_data())
            .await;
    }
}

/// `issue_comment`: bot commands and the plain-issue reply.
pub struct IssueCommentHandler {
    commands: Arc<CommandProcessor>,
}

impl IssueCommentHandler {
    pub fn new(commands: Arc<CommandProcessor>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl WebhookHandler for IssueCommentHandler {
    async fn handle(&self, dispatch: Dispatch, payload: Arc<Value>) {
        let event = match IssueCommentEvent::deserialize(payload.as_ref()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed issue_comment payload: {}", e);
                return;
            }
        };

        self.commands.handle_comment(dispatch.seq, &event).await;
    }
}
