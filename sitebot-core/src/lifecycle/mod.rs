//! Explicit state machine for a preview instance.
//!
//! The design separates:
//! - **State**: where an instance is (`InstanceState`)
//! - **Events**: what happened (`Event`)
//! - **Effects**: what to do (`Effect`)
//! - **Transition**: pure function `(State, Event) -> (Option<State>, Vec<Effect>)`
//!
//! The server's interpreter executes effects against the site builder and
//! GitHub and feeds the result events back in.

pub mod effect;
pub mod event;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use transition::*;

/// Pull request webhook actions that affect instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrAction {
    Opened,
    Reopened,
    /// New commits were pushed to the head branch.
    Synchronize,
    Closed,
}

impl PrAction {
    /// Map a webhook `action` string. Anything else is not ours to handle.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "opened" => Some(Self::Opened),
            "reopened" => Some(Self::Reopened),
            "synchronize" => Some(Self::Synchronize),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// What the instance manager should do for an incoming action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    /// Create the record (and allocate its ports) before delivering `event`.
    pub spawn: bool,
    pub event: Event,
}

/// Decide how to handle `action` given whether an instance already exists.
///
/// Actions that find no instance always spawn one first, so a `synchronize`
/// delivered before (or without) its `opened` still ends in a running site,
/// and a `closed` for an unknown PR runs the same teardown path harmlessly.
pub fn plan(action: PrAction, exists: bool) -> DispatchPlan {
    let event = match action {
        PrAction::Opened | PrAction::Reopened => Event::DownloadRequested,
        PrAction::Synchronize => Event::EditRequested,
        PrAction::Closed => Event::RemoveRequested,
    };
    DispatchPlan {
        spawn: !exists,
        event,
    }
}
