//! Placement errors.

use std::fmt;

use hoster_id::NodeId;
use serde::Serialize;
use thiserror::Error;

use super::alerts::OrphanResource;
use crate::db::DbError;
use crate::node::{NodeStatus, ValidationError};
use crate::providers::ProviderError;

/// Workflow stage an error is attributed to.
///
/// Lets an operator tell a failure before anything external existed
/// (`select`, `reserve`) from one that may have left resources behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Select,
    Reserve,
    Compute,
    Dns,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Reserve => "reserve",
            Self::Compute => "compute",
            Self::Dns => "dns",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a failed orchestrator operation.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ValidationError),

    /// Every selection attempt lost its decrement to a concurrent request.
    #[error("capacity contention: lost {attempts} consecutive selection races")]
    CapacityContention { attempts: u32 },

    #[error("{stage}: provider failed transiently: {message}")]
    ProviderTransient { stage: Stage, message: String },

    #[error("{stage}: provider rejected request: {message}")]
    ProviderRejected { stage: Stage, message: String },

    #[error("{stage}: provider outcome unknown: {message}")]
    ProviderAmbiguous { stage: Stage, message: String },

    /// A compensating delete failed. The orphans need manual cleanup and
    /// retrying the placement is not safe until they are handled.
    #[error("{stage}: rollback failed after `{cause}`; {} orphaned resource(s)", .orphans.len())]
    RollbackFailed {
        stage: Stage,
        cause: String,
        orphans: Vec<OrphanResource>,
    },

    #[error("{stage}: persistence error: {source}")]
    Persistence {
        stage: Stage,
        #[source]
        source: DbError,
    },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node {id} is {status}")]
    NodeUnavailable { id: NodeId, status: NodeStatus },
}

impl PlacementError {
    pub(crate) fn provider(stage: Stage, err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(message) => Self::ProviderTransient { stage, message },
            ProviderError::Rejected(message) => Self::ProviderRejected { stage, message },
            ProviderError::Ambiguous(message) => Self::ProviderAmbiguous { stage, message },
        }
    }

    pub(crate) fn persistence(stage: Stage, source: DbError) -> Self {
        match source {
            DbError::NotFound(id) => Self::NodeNotFound(id),
            DbError::NotWell { id, status } => Self::NodeUnavailable { id, status },
            source => Self::Persistence { stage, source },
        }
    }

    /// Stage the error was raised at, if it belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ProviderTransient { stage, .. }
            | Self::ProviderRejected { stage, .. }
            | Self::ProviderAmbiguous { stage, .. }
            | Self::RollbackFailed { stage, .. }
            | Self::Persistence { stage, .. } => Some(*stage),
            Self::CapacityContention { .. } => Some(Stage::Select),
            Self::InvalidRequest(_) | Self::NodeNotFound(_) | Self::NodeUnavailable { .. } => None,
        }
    }

    /// Returns true if issuing the same request again may succeed without
    /// operator involvement.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CapacityContention { .. } | Self::ProviderTransient { .. } => true,
            Self::Persistence { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
