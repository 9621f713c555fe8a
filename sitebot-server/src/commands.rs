//! Handles `@bot` commands left in pull request comments.

use sitebot_core::{parse_comment, InstanceError, ParseResult, SiteCommand};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::comments::{template_ids, CommentComposer};
use crate::dispatch::TaskSeq;
use crate::instances::InstanceManager;
use crate::payload::IssueCommentEvent;

pub struct CommandProcessor {
    manager: Arc<InstanceManager>,
}

impl CommandProcessor {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }

    fn composer(&self) -> &CommentComposer {
        self.manager.composer()
    }

    /// Entry point for `issue_comment` events.
    pub async fn handle_comment(&self, seq: TaskSeq, event: &IssueCommentEvent) {
        if event.sender.login.eq_ignore_ascii_case(self.composer().bot_login()) {
            debug!("Ignoring comment {} from the bot itself", event.comment.id);
            return;
        }

        if event.action != "created" {
            debug!("Ignoring issue_comment action {}", event.action);
            return;
        }

        if !event.is_pull_request() {
            self.send_non_pr_response(event).await;
            return;
        }

        if event.is_closed() {
            debug!("Ignoring comment on closed PR #{}", event.pr_id());
            return;
        }

        self.parse(seq, event).await;
    }

    /// Explain that previews only exist for pull requests.
    ///
    /// Only replies when the comment is addressed to the bot.
    pub async fn send_non_pr_response(&self, event: &IssueCommentEvent) {
        if parse_comment(&event.comment.body, self.composer().bot_login()) == ParseResult::NoMention
        {
            return;
        }

        info!("Command on issue #{}, which is not a pull request", event.pr_id());
        self.reply(event, template_ids::NON_PULL_REQUEST).await;
    }

    /// Run the command in the comment, if any.
    pub async fn parse(&self, seq: TaskSeq, event: &IssueCommentEvent) {
        let pr = event.pr_id();

        let command = match parse_comment(&event.comment.body, self.composer().bot_login()) {
            ParseResult::NoMention => return,
            ParseResult::UnrecognizedCommand { attempted } => {
                info!(
                    "Unrecognized command {:?} from {} on PR #{}",
                    attempted, event.comment.user.login, pr
                );
                self.reply(event, template_ids::HELP).await;
                return;
            }
            ParseResult::Command(command) => command,
        };

        info!(
            "Command {} from {} on PR #{}",
            command, event.comment.user.login, pr
        );

        match command {
            SiteCommand::Help => self.reply(event, template_ids::HELP).await,

            // The lifecycle posts its own result comment
            SiteCommand::Rebuild => match self.manager.edit(pr).await {
                Ok(_) => {}
                Err(InstanceError::NotFound(_)) => {
                    self.reply(event, template_ids::NO_INSTANCE).await
                }
                Err(e) => error!("Rebuild of PR #{} failed: {}", pr, e),
            },

            SiteCommand::Stop => match self.manager.remove(pr, Some(seq)).await {
                Ok(record) => {
                    let context = self.composer().request_context(&record.data);
                    self.composer()
                        .notify(&event.target(), template_ids::STOPPED, &context)
                        .await;
                }
                Err(InstanceError::NotFound(_)) => {
                    self.reply(event, template_ids::NO_INSTANCE).await
                }
                Err(e) => error!("Stop of PR #{} failed: {}", pr, e),
            },

            SiteCommand::Status => match self.manager.get_instance(pr).await {
                Ok(record) => {
                    let context = self.composer().instance_context(&record);
                    self.composer()
                        .notify(&event.target(), template_ids::STATUS, &context)
                        .await;
                }
                Err(_) => self.reply(event, template_ids::NO_INSTANCE).await,
            },
        }
    }

    async fn reply(&self, event: &IssueCommentEvent, template_id: &str) {
        let composer = self.composer();
        composer
            .notify(&event.target(), template_id, &composer.base_context())
            .await;
    }
}
