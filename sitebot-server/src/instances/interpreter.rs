//! Effect interpreter.
//!
//! The boundary between the pure lifecycle transitions and the outside world:
//! takes effects, runs them against the site builder and the comment composer,
//! and returns the event the builder work produced, if any.

use sitebot_core::{ContextField, Effect, Event, InstanceRecord, LogLevel, Notice};
use tracing::{debug, error, info, warn};

use crate::builder::SiteBuilder;
use crate::comments::{external_text, template_ids, CommentComposer};
use crate::github::CommentTarget;

/// Collaborators the interpreter drives.
pub struct InterpreterContext<'a> {
    pub builder: &'a dyn SiteBuilder,
    pub composer: &'a CommentComposer,
}

/// Execute effects in order against `record`.
///
/// At most one effect per transition talks to the builder, so at most one
/// result event comes back. Failures are turned into events, never errors.
pub async fn execute_effects(
    ctx: &InterpreterContext<'_>,
    record: &InstanceRecord,
    effects: Vec<Effect>,
) -> Option<Event> {
    let mut result = None;

    for effect in effects {
        if let Some(event) = execute_effect(ctx, record, effect).await {
            result = Some(event);
        }
    }

    result
}

async fn execute_effect(
    ctx: &InterpreterContext<'_>,
    record: &InstanceRecord,
    effect: Effect,
) -> Option<Event> {
    match effect {
        Effect::Provision => Some(match ctx.builder.provision(record).await {
            Ok(()) => Event::BuildSucceeded,
            Err(e) => Event::BuildFailed {
                error: format!("{:#}", e),
            },
        }),

        Effect::Rebuild => Some(match ctx.builder.rebuild(record).await {
            Ok(()) => Event::BuildSucceeded,
            Err(e) => Event::BuildFailed {
                error: format!("{:#}", e),
            },
        }),

        Effect::Teardown => Some(match ctx.builder.teardown(record).await {
            Ok(()) => Event::TeardownCompleted,
            Err(e) => Event::TeardownFailed {
                error: format!("{:#}", e),
            },
        }),

        Effect::Notify(notice) => {
            execute_notify(ctx, record, notice).await;
            None
        }

        Effect::Log { level, message } => {
            let pr = record.pr_id();
            match level {
                LogLevel::Debug => debug!("PR #{}: {}", pr, message),
                LogLevel::Info => info!("PR #{}: {}", pr, message),
                LogLevel::Warn => warn!("PR #{}: {}", pr, message),
                LogLevel::Error => error!("PR #{}: {}", pr, message),
            }
            None
        }
    }
}

async fn execute_notify(ctx: &InterpreterContext<'_>, record: &InstanceRecord, notice: Notice) {
    let mut context = ctx.composer.instance_context(record);
    let template_id = match notice {
        Notice::Deployed => template_ids::NEW_DEFAULT,
        Notice::Updated => template_ids::EDIT,
        Notice::BuildFailed { error } => {
            context.insert(ContextField::ErrorMessage, external_text(&error));
            template_ids::BUILD_FAILED
        }
    };

    ctx.composer
        .notify(&CommentTarget::from(&record.data), template_id, &context)
        .await;
}
