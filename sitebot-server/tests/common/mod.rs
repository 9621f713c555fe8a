#![allow(dead_code)]

use axum::body::Bytes;
use serde_json::{json, Value};
use sitebot_core::PortAllocator;
use std::sync::Arc;
use std::time::Duration;

use sitebot_server::commands::CommandProcessor;
use sitebot_server::comments::{default_templates, CommentComposer};
use sitebot_server::dispatch::{DelayedScheduler, EventRouter, IncomingEvent};
use sitebot_server::handlers::{IssueCommentHandler, PullRequestHandler};
use sitebot_server::instances::{InstanceManager, InstanceRegistry};
use sitebot_server::test_support::{FakeBuilder, RecordingSink};
use sitebot_server::AppState;

pub const BOT: &str = "preview-bot";
pub const SECRET: &str = "webhook-secret";
pub const STATUS_TOKEN: &str = "status-token";

pub struct Harness {
    pub state: Arc<AppState>,
    pub builder: Arc<FakeBuilder>,
    pub sink: Arc<RecordingSink>,
}

pub struct HarnessOptions {
    pub pull_request_delay: Duration,
    pub builder: FakeBuilder,
    pub min_port: u16,
    pub max_port: u16,
    pub block_size: usize,
    pub status_auth_token: Option<String>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            pull_request_delay: Duration::from_millis(15_000),
            builder: FakeBuilder::default(),
            min_port: 9000,
            max_port: 9019,
            block_size: 1,
            status_auth_token: Some(STATUS_TOKEN.to_string()),
        }
    }
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let builder = Arc::new(options.builder);
        let sink = Arc::new(RecordingSink::default());
        let scheduler = DelayedScheduler::new();

        let composer = Arc::new(CommentComposer::new(
            default_templates().unwrap(),
            sink.clone(),
            BOT.to_string(),
            "preview.example.com".to_string(),
        ));
        let max_block = (options.block_size > 1).then_some(options.block_size);
        let ports = PortAllocator::new(options.min_port, options.max_port, max_block).unwrap();
        let manager = Arc::new(InstanceManager::new(
            InstanceRegistry::new(ports, options.block_size),
            builder.clone(),
            composer,
            Arc::clone(&scheduler),
        ));
        let commands = Arc::new(CommandProcessor::new(Arc::clone(&manager)));

        let mut router = EventRouter::new(Arc::clone(&scheduler));
        router
            .add_listener(
                "issue_comment",
                Arc::new(IssueCommentHandler::new(commands)),
                Duration::ZERO,
            )
            .add_listener(
                "pull_request",
                Arc::new(PullRequestHandler::new(Arc::clone(&manager))),
                options.pull_request_delay,
            );

        let state = Arc::new(AppState {
            webhook_secret: SECRET.to_string(),
            router: Arc::new(router),
            manager,
            scheduler,
            status_auth_token: options.status_auth_token,
        });

        Self {
            state,
            builder,
            sink,
        }
    }

    pub fn deliver(&self, event_name: &str, payload: &Value) -> usize {
        self.state.router.check_incoming(IncomingEvent {
            event_name: Some(event_name.to_string()),
            delivery_id: uuid::Uuid::new_v4().to_string(),
            body: Bytes::from(serde_json::to_vec(payload).unwrap()),
        })
    }

    pub fn pull_request(&self, action: &str, pr: u64) -> usize {
        self.deliver("pull_request", &pull_request_payload(action, pr))
    }

    pub fn comment(&self, pr: u64, body: &str) -> usize {
        self.deliver("issue_comment", &comment_payload(pr, body, "carol"))
    }
}

pub fn pull_request_payload(action: &str, pr: u64) -> Value {
    json!({
        "action": action,
        "number": pr,
        "pull_request": {
            "number": pr,
            "head": {
                "ref": format!("feature-{}", pr),
                "repo": {"name": "site", "full_name": "alice/site", "owner": {"login": "alice"}}
            }
        },
        "repository": {"name": "site", "full_name": "acme/site", "owner": {"login": "acme"}},
        "sender": {"login": "alice"}
    })
}

pub fn comment_payload(pr: u64, body: &str, author: &str) -> Value {
    json!({
        "action": "created",
        "issue": {
            "number": pr,
            "state": "open",
            "pull_request": {"url": format!("https://api.github.com/repos/acme/site/pulls/{}", pr)}
        },
        "comment": {"id": 100 + pr, "body": body, "user": {"login": author}},
        "repository": {"name": "site", "full_name": "acme/site", "owner": {"login": "acme"}},
        "sender": {"login": author}
    })
}

/// Let spawned tasks run, advancing paused time by `ms`.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
