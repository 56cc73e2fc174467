//! Capacity store error types.

use hoster_id::NodeId;
use thiserror::Error;

use crate::node::NodeStatus;

/// Capacity store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The node exists but no longer has room for the demand, or is not
    /// eligible for placements anymore.
    #[error("node {0} has insufficient capacity")]
    InsufficientCapacity(NodeId),

    /// A node with the same id or provider instance name already exists.
    #[error("node already exists: {0}")]
    DuplicateIdentity(String),

    #[error("node not found: {0}")]
    NotFound(NodeId),

    /// The node is not in a status from which the requested transition is
    /// legal.
    #[error("node {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// Capacity can only be released on a `Well` node.
    #[error("node {id} is {status}, not well")]
    NotWell { id: NodeId, status: NodeStatus },

    /// Releasing would push free capacity above the node's totals.
    #[error("releasing capacity on node {0} would exceed its totals")]
    CapacityOverflow(NodeId),

    /// A stored row could not be mapped back onto the node model.
    #[error("corrupt node row {node_id}: {reason}")]
    Corrupt { node_id: String, reason: String },

    /// The store was reached but is refusing work.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Returns true if a later identical call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Unavailable(_) | Self::InsufficientCapacity(_) => true,
            Self::Query(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Returns true if the error reports a conflict on the node's current
    /// state rather than a storage failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity(_)
                | Self::DuplicateIdentity(_)
                | Self::InvalidTransition { .. }
                | Self::NotWell { .. }
                | Self::CapacityOverflow(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let id = NodeId::new();
        assert!(DbError::InsufficientCapacity(id).is_transient());
        assert!(DbError::InsufficientCapacity(id).is_conflict());
        assert!(DbError::Unavailable("down".into()).is_transient());
        assert!(!DbError::NotFound(id).is_transient());
        assert!(!DbError::NotFound(id).is_conflict());
        assert!(DbError::Query(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DbError::Query(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_transition_message() {
        let id = NodeId::new();
        let err = DbError::InvalidTransition {
            id,
            from: NodeStatus::Stopped,
            to: NodeStatus::Well,
        };
        assert_eq!(
            err.to_string(),
            format!("node {id} cannot move from stopped to well")
        );
    }
}
