mod middleware;

pub use middleware::{TracingMiddleware, REQUEST_ID_HEADER};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use sitebot_core::{InstanceData, PrId};
use std::fmt;
use tracing::{error, info};

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Pull request thread a comment is posted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTarget {
    pub repo_account: String,
    pub repo_name: String,
    pub pr_id: PrId,
}

impl CommentTarget {
    pub fn new(repo_account: impl Into<String>, repo_name: impl Into<String>, pr_id: PrId) -> Self {
        Self {
            repo_account: repo_account.into(),
            repo_name: repo_name.into(),
            pr_id,
        }
    }
}

impl From<&InstanceData> for CommentTarget {
    fn from(data: &InstanceData) -> Self {
        Self::new(&data.pr_repo_account, &data.pr_repo_name, data.pr_id)
    }
}

impl fmt::Display for CommentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_account, self.repo_name, self.pr_id)
    }
}

/// Delivers rendered comments to a pull request thread.
#[async_trait]
pub trait CommentSink: Send + Sync {
    async fn post_comment(&self, target: &CommentTarget, body: &str) -> Result<()>;
}

/// Fetches a gzipped tarball of a branch.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn download_archive(&self, repo_full_name: &str, git_ref: &str) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

impl GitHubClient {
    pub fn new(token: String) -> Result<Self> {
        Ok(Self {
            client: create_github_client()?,
            token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
    }

    /// Login of the account the token belongs to; the bot identity.
    pub async fn authenticated_login(&self) -> Result<String> {
        let url = format!("{}/user", GITHUB_API_BASE);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to send authenticated user request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub API error resolving bot identity: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub API error resolving bot identity: {} - {}",
                status,
                error_text
            ));
        }

        let user: UserResponse = response
            .json()
            .await
            .context("Failed to parse authenticated user response")?;
        Ok(user.login)
    }

    pub async fn post_issue_comment(
        &self,
        repo_owner: &str,
        repo_name: &str,
        number: PrId,
        comment_body: &str,
    ) -> Result<u64> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            GITHUB_API_BASE, repo_owner, repo_name, number
        );

        info!(
            "Posting comment to PR #{} in {}/{}",
            number, repo_owner, repo_name
        );

        let response = self
            .authorized(self.client.post(&url))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&CreateCommentRequest {
                body: comment_body,
            })?)
            .send()
            .await
            .context("Failed to send PR comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error: {} - {}", status, error_text);
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        let comment: CommentResponse = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Successfully posted comment with ID: {}", comment.id);

        Ok(comment.id)
    }

    /// Download `repo_full_name` at `git_ref` as a gzipped tarball.
    pub async fn download_archive(&self, repo_full_name: &str, git_ref: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/tarball/{}",
            GITHUB_API_BASE, repo_full_name, git_ref
        );

        info!("Downloading archive of {} at {}", repo_full_name, git_ref);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Failed to send archive request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!(
                "GitHub API error downloading {}@{}: {} - {}",
                repo_full_name,
                git_ref,
                status,
                error_text
            ));
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read archive body")?;
        info!("Downloaded {} byte archive", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl CommentSink for GitHubClient {
    async fn post_comment(&self, target: &CommentTarget, body: &str) -> Result<()> {
        self.post_issue_comment(&target.repo_account, &target.repo_name, target.pr_id, body)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ArchiveSource for GitHubClient {
    async fn download_archive(&self, repo_full_name: &str, git_ref: &str) -> Result<Vec<u8>> {
        GitHubClient::download_archive(self, repo_full_name, git_ref).await
    }
}

pub fn create_github_client() -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(concat!("sitebot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client).with(TracingMiddleware).build())
}
