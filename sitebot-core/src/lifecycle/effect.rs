//! Effects (side effects as data).
//!
//! Effects describe what should happen as a result of a state transition.
//! The interpreter in the server crate executes them.

/// All effects that can be produced by state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Download the branch archive and start the site on its ports.
    Provision,

    /// Stop the site, refresh its sources and start it again on the same ports.
    Rebuild,

    /// Stop the site and delete its artifacts.
    Teardown,

    /// Post a status comment on the pull request.
    Notify(Notice),

    Log { level: LogLevel, message: String },
}

/// Status comments the lifecycle posts on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// First successful deployment (or a full re-download).
    Deployed,
    /// Rebuilt after new commits.
    Updated,
    BuildFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}
