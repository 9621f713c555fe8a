//! Instance records: one preview site per pull request.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ports::{PortBlock, PortError};

/// Newtype for a pull request number, the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PrId(pub u64);

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PrId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

/// Where an instance is in its lifecycle.
///
/// An instance that has been removed is simply absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    /// Created, or a fresh download and start is in progress.
    Provisioning,
    /// Serving on its assigned port.
    Running,
    /// Rebuilding in place after new commits; the port is retained.
    Updating,
    /// The last build failed. Ports stay reserved so a later push can retry.
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pull request details captured when an instance is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceData {
    pub pr_id: PrId,
    /// Head branch of the pull request.
    pub branch: String,
    /// `owner/name` of the repository the head branch lives in (may be a fork).
    pub source_repo_full_name: String,
    /// Owner of the repository the pull request was opened against.
    pub pr_repo_account: String,
    pub pr_repo_name: String,
    pub pr_author: String,
}

/// A live instance. Identity fields and the port block never change after
/// creation; only `state` and the timestamps move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    #[serde(flatten)]
    pub data: InstanceData,
    pub ports: PortBlock,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_deployed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(data: InstanceData, ports: PortBlock, created_at: DateTime<Utc>) -> Self {
        Self {
            data,
            ports,
            state: InstanceState::Provisioning,
            created_at,
            last_deployed_at: None,
        }
    }

    pub fn pr_id(&self) -> PrId {
        self.data.pr_id
    }

    pub fn assigned_port(&self) -> u16 {
        self.ports.first()
    }

    /// Time of the last successful deployment, or creation if there was none.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_deployed_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    #[error("no instance exists for PR #{0}")]
    NotFound(PrId),

    #[error("an instance already exists for PR #{0}")]
    AlreadyExists(PrId),

    #[error(transparent)]
    Ports(#[from] PortError),
}

impl InstanceError {
    /// True when the failure means the port pool could not satisfy a spawn.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::Ports(PortError::ResourceExhausted { .. }))
    }
}
