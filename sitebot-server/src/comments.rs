//! Rendering and delivery of pull request comments.

use anyhow::Result;
use sitebot_core::template::PLACEHOLDER_OPEN;
use sitebot_core::{
    CommentContext, ContextField, InstanceData, InstanceRecord, TemplateError, TemplateRegistry,
};
use std::sync::Arc;
use tracing::{error, info};

use crate::github::{CommentSink, CommentTarget};

/// Identifiers of the templates registered by [`default_templates`].
pub mod template_ids {
    pub const NEW_DEFAULT: &str = "newDefault";
    pub const EDIT: &str = "edit";
    pub const NEW_NO_RESOURCES: &str = "newNoResources";
    pub const BUILD_FAILED: &str = "buildFailed";
    pub const EXPIRED: &str = "expired";
    pub const NON_PULL_REQUEST: &str = "nonPullRequest";
    pub const NO_INSTANCE: &str = "noInstance";
    pub const STATUS: &str = "status";
    pub const STOPPED: &str = "stopped";
    pub const HELP: &str = "help";
}

/// Longest piece of outside text (build output, API errors) put in a comment.
pub const MAX_EXTERNAL_TEXT_CHARS: usize = 2_000;

/// Make untrusted text safe to substitute into a template.
///
/// Placeholder markers are broken up with a zero-width space so rendering
/// never mistakes them for fields, and long text is cut to
/// [`MAX_EXTERNAL_TEXT_CHARS`].
pub fn external_text(text: &str) -> String {
    let mut cleaned = text.replace(PLACEHOLDER_OPEN, "~~\u{200B}{");
    if let Some((cut, _)) = cleaned.char_indices().nth(MAX_EXTERNAL_TEXT_CHARS) {
        cleaned.truncate(cut);
        cleaned.push_str("\n[truncated]");
    }
    cleaned
}

/// The stock comment set. Fails only if a template names an unknown field.
pub fn default_templates() -> Result<TemplateRegistry, TemplateError> {
    use template_ids::*;

    let mut templates = TemplateRegistry::new();
    templates.register_indented(
        NEW_DEFAULT,
        "Hey there, @~~{PRAuthor}!
        A preview of `~~{Branch}` is up at http://~~{LinkDomain}:~~{AssignedPort}

        It is rebuilt on every push. Comment `@~~{BotLoginUsername} help` to see what else I can do.",
    )?;
    templates.register_indented(
        EDIT,
        "The preview of `~~{Branch}` has been rebuilt with your latest commits.
        It is still at http://~~{LinkDomain}:~~{AssignedPort}",
    )?;
    templates.register_indented(
        NEW_NO_RESOURCES,
        "Sorry @~~{PRAuthor}, every preview slot is taken right now, so `~~{Branch}` was not deployed.
        Push again or comment `@~~{BotLoginUsername} rebuild` once another pull request has closed.",
    )?;
    templates.register_indented(
        BUILD_FAILED,
        "The preview of `~~{Branch}` failed to start:

        ```
        ~~{ErrorMessage}
        ```

        Push a fix or comment `@~~{BotLoginUsername} rebuild` to try again.",
    )?;
    templates.register_indented(
        EXPIRED,
        "The preview of `~~{Branch}` saw no deployments for ~~{IdleHours} hours and has been shut down.
        Push again or comment `@~~{BotLoginUsername} rebuild` to bring it back.",
    )?;
    templates.register_indented(
        NON_PULL_REQUEST,
        "Hi! I only run previews for pull requests, so there is nothing for me to do on this issue.",
    )?;
    templates.register_indented(
        NO_INSTANCE,
        "There is no preview running for this pull request.
        Push a commit to start one.",
    )?;
    templates.register_indented(
        STATUS,
        "The preview of `~~{Branch}` from ~~{SourceRepoFullName} is at http://~~{LinkDomain}:~~{AssignedPort}",
    )?;
    templates.register_indented(
        STOPPED,
        "The preview of `~~{Branch}` has been stopped and its port released.",
    )?;
    templates.register_indented(
        HELP,
        "Comment with one of these at the start of a line:

        - `@~~{BotLoginUsername} rebuild` rebuilds the preview from the branch head
        - `@~~{BotLoginUsername} stop` shuts the preview down
        - `@~~{BotLoginUsername} status` links the running preview
        - `@~~{BotLoginUsername} help` shows this message",
    )?;

    Ok(templates)
}

/// Builds comment text from templates and posts it through a [`CommentSink`].
pub struct CommentComposer {
    templates: TemplateRegistry,
    sink: Arc<dyn CommentSink>,
    bot_login: String,
    link_domain: String,
}

impl CommentComposer {
    pub fn new(
        templates: TemplateRegistry,
        sink: Arc<dyn CommentSink>,
        bot_login: String,
        link_domain: String,
    ) -> Self {
        Self {
            templates,
            sink,
            bot_login,
            link_domain,
        }
    }

    pub fn bot_login(&self) -> &str {
        &self.bot_login
    }

    pub fn preview_link(&self, record: &InstanceRecord) -> String {
        format!("http://{}:{}", self.link_domain, record.assigned_port())
    }

    pub async fn send_comment(&self, target: &CommentTarget, text: &str) -> Result<()> {
        info!("Commenting on {}", target);
        self.sink.post_comment(target, text).await
    }

    pub fn build_message(
        &self,
        template_id: &str,
        context: &CommentContext,
    ) -> Result<String, TemplateError> {
        self.templates.build_message(template_id, context)
    }

    /// Bot identity and link domain, shared by every comment.
    pub fn base_context(&self) -> CommentContext {
        CommentContext::new()
            .with(ContextField::BotLoginUsername, &self.bot_login)
            .with(ContextField::LinkDomain, &self.link_domain)
    }

    /// Context for a pull request that has no instance (and so no port).
    pub fn request_context(&self, data: &InstanceData) -> CommentContext {
        self.base_context()
            .with(ContextField::PrId, data.pr_id)
            .with(ContextField::Branch, &data.branch)
            .with(ContextField::SourceRepoFullName, &data.source_repo_full_name)
            .with(ContextField::PrRepoAccount, &data.pr_repo_account)
            .with(ContextField::PrRepoName, &data.pr_repo_name)
            .with(ContextField::PrAuthor, &data.pr_author)
    }

    pub fn instance_context(&self, record: &InstanceRecord) -> CommentContext {
        self.request_context(&record.data)
            .with(ContextField::AssignedPort, record.assigned_port())
    }

    /// Render and post, logging instead of failing.
    ///
    /// Comment delivery never affects instance state.
    pub async fn notify(&self, target: &CommentTarget, template_id: &str, context: &CommentContext) {
        let text = match self.build_message(template_id, context) {
            Ok(text) => text,
            Err(e) => {
                error!("Could not render {} comment for {}: {}", template_id, target, e);
                return;
            }
        };

        if let Err(e) = self.send_comment(target, &text).await {
            error!("Failed to post {} comment on {}: {:#}", template_id, target, e);
        }
    }
}
