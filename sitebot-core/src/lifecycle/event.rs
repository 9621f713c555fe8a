//! Events that trigger instance state transitions.

/// All events that can trigger state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // =========================================================================
    // Requests
    // =========================================================================
    /// Fetch the branch archive and (re)start the site from scratch.
    DownloadRequested,

    /// Rebuild in place after new commits, keeping the port block.
    EditRequested,

    /// Tear the site down and release its ports.
    RemoveRequested,

    // =========================================================================
    // Builder results
    // =========================================================================
    BuildSucceeded,

    BuildFailed { error: String },

    TeardownCompleted,

    /// Teardown did not complete cleanly. The record is still retired.
    TeardownFailed { error: String },
}

impl Event {
    /// A short, single-line description for logs.
    pub fn log_summary(&self) -> &'static str {
        match self {
            Self::DownloadRequested => "DownloadRequested",
            Self::EditRequested => "EditRequested",
            Self::RemoveRequested => "RemoveRequested",
            Self::BuildSucceeded => "BuildSucceeded",
            Self::BuildFailed { .. } => "BuildFailed",
            Self::TeardownCompleted => "TeardownCompleted",
            Self::TeardownFailed { .. } => "TeardownFailed",
        }
    }
}
