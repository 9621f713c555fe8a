//! Typed views of the webhook payloads the bot reacts to.
//!
//! Only the fields the bot reads are modelled; everything else is ignored.

use serde::Deserialize;
use sitebot_core::{InstanceData, PrId};

use crate::github::CommentTarget;

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestRef,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// `None` when the fork the branch lived in has been deleted.
    pub repo: Option<Repository>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
    pub state: String,
    /// Present only when the issue is a pull request.
    pub pull_request: Option<PullRequestLink>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestLink {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub user: User,
}

impl PullRequestEvent {
    /// Identity fields for the instance this event is about.
    pub fn instance_data(&self) -> InstanceData {
        let source_repo_full_name = self
            .pull_request
            .head
            .repo
            .as_ref()
            .unwrap_or(&self.repository)
            .full_name
            .clone();

        InstanceData {
            pr_id: PrId(self.number),
            branch: self.pull_request.head.ref_name.clone(),
            source_repo_full_name,
            pr_repo_account: self.repository.owner.login.clone(),
            pr_repo_name: self.repository.name.clone(),
            pr_author: self.sender.login.clone(),
        }
    }
}

impl IssueCommentEvent {
    pub fn pr_id(&self) -> PrId {
        PrId(self.issue.number)
    }

    pub fn is_pull_request(&self) -> bool {
        self.issue.pull_request.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.issue.state == "closed"
    }

    /// Thread to reply on.
    pub fn target(&self) -> CommentTarget {
        CommentTarget::new(
            &self.repository.owner.login,
            &self.repository.name,
            self.pr_id(),
        )
    }
}
