//! Pure state transition function.
//!
//! `transition` has no side effects. A result state of `None` means the
//! instance is gone: the caller must release its ports and drop the record.

use super::effect::{Effect, LogLevel, Notice};
use super::event::Event;
use crate::instance::InstanceState;

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The new state, or `None` once the instance has been removed.
    pub state: Option<InstanceState>,
    /// Effects to execute.
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: InstanceState, effects: Vec<Effect>) -> Self {
        Self {
            state: Some(state),
            effects,
        }
    }

    pub fn removed(effects: Vec<Effect>) -> Self {
        Self {
            state: None,
            effects,
        }
    }

    /// Stay in `state` and log that `event` did not apply.
    fn ignored(state: InstanceState, event: &Event) -> Self {
        Self::new(
            state,
            vec![Effect::Log {
                level: LogLevel::Warn,
                message: format!(
                    "Ignoring {} while instance is {}",
                    event.log_summary(),
                    state
                ),
            }],
        )
    }
}

pub fn transition(state: InstanceState, event: Event) -> TransitionResult {
    use InstanceState::*;

    match (state, event) {
        (Provisioning | Running | Failed, Event::DownloadRequested) => {
            TransitionResult::new(Provisioning, vec![Effect::Provision])
        }

        (Provisioning | Running | Failed, Event::EditRequested) => {
            TransitionResult::new(Updating, vec![Effect::Rebuild])
        }

        (Provisioning, Event::BuildSucceeded) => {
            TransitionResult::new(Running, vec![Effect::Notify(Notice::Deployed)])
        }

        (Updating, Event::BuildSucceeded) => {
            TransitionResult::new(Running, vec![Effect::Notify(Notice::Updated)])
        }

        (Provisioning | Updating, Event::BuildFailed { error }) => TransitionResult::new(
            Failed,
            vec![
                Effect::Log {
                    level: LogLevel::Error,
                    message: format!("Build failed: {}", error),
                },
                Effect::Notify(Notice::BuildFailed { error }),
            ],
        ),

        (_, Event::RemoveRequested) => TransitionResult::new(state, vec![Effect::Teardown]),

        (_, Event::TeardownCompleted) => TransitionResult::removed(vec![]),

        // Ports are released anyway: a closed PR must not pin part of the pool.
        (_, Event::TeardownFailed { error }) => TransitionResult::removed(vec![Effect::Log {
            level: LogLevel::Warn,
            message: format!("Teardown failed, releasing ports anyway: {}", error),
        }]),

        (state, event) => TransitionResult::ignored(state, &event),
    }
}
