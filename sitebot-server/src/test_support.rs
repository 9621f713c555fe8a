//! In-memory collaborators for tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sitebot_core::{InstanceData, InstanceRecord, PrId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::builder::SiteBuilder;
use crate::github::{CommentSink, CommentTarget};

/// Pull request details for `pr`, authored by alice from her fork.
pub fn instance_data(pr: u64) -> InstanceData {
    InstanceData {
        pr_id: PrId(pr),
        branch: format!("feature-{}", pr),
        source_repo_full_name: "alice/site".to_string(),
        pr_repo_account: "acme".to_string(),
        pr_repo_name: "site".to_string(),
        pr_author: "alice".to_string(),
    }
}

/// Keeps every comment instead of posting it.
#[derive(Default)]
pub struct RecordingSink {
    comments: Mutex<Vec<(CommentTarget, String)>>,
    fail: bool,
}

impl RecordingSink {
    /// A sink whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            comments: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn comments(&self) -> Vec<(CommentTarget, String)> {
        self.comments.lock().await.clone()
    }

    pub async fn comments_for(&self, pr: PrId) -> Vec<String> {
        self.comments
            .lock()
            .await
            .iter()
            .filter(|(target, _)| target.pr_id == pr)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl CommentSink for RecordingSink {
    async fn post_comment(&self, target: &CommentTarget, body: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("GitHub API error: 502 Bad Gateway"));
        }
        self.comments
            .lock()
            .await
            .push((target.clone(), body.to_string()));
        Ok(())
    }
}

/// Scripted site builder that records calls as `"<op> <pr>"`.
#[derive(Default)]
pub struct FakeBuilder {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<String>>,
    delay: Option<Duration>,
    active: std::sync::Mutex<HashSet<PrId>>,
    overlaps: AtomicUsize,
}

impl FakeBuilder {
    /// Every operation takes `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next operation fail with `message`.
    pub async fn fail_next(&self, message: &str) {
        self.failures.lock().await.push_back(message.to_string());
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Times an operation started while another one for the same PR was running.
    pub fn overlapping_calls(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn enter(&self, pr: PrId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(pr) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self, pr: PrId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&pr);
    }

    async fn run(&self, op: &str, record: &InstanceRecord) -> Result<()> {
        let pr = record.pr_id();
        self.calls.lock().await.push(format!("{} {}", op, pr));
        self.enter(pr);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.exit(pr);
        match self.failures.lock().await.pop_front() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SiteBuilder for FakeBuilder {
    async fn provision(&self, record: &InstanceRecord) -> Result<()> {
        self.run("provision", record).await
    }

    async fn rebuild(&self, record: &InstanceRecord) -> Result<()> {
        self.run("rebuild", record).await
    }

    async fn teardown(&self, record: &InstanceRecord) -> Result<()> {
        self.run("teardown", record).await
    }
}
