//! A single sweep pass.

use std::sync::Arc;

use chrono::Utc;
use hoster_reconcile::StalePolicy;
use tracing::{debug, warn};

use crate::db::DbError;
use crate::orchestrator::Orchestrator;

/// Outcome of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Stuck nodes found.
    pub examined: usize,
    /// Nodes cleaned up and marked stopped.
    pub reclaimed: usize,
    /// Nodes left for the next pass.
    pub failed: usize,
}

/// Finds and reclaims stuck nodes.
pub struct StuckNodeSweeper {
    orchestrator: Arc<Orchestrator>,
    policy: StalePolicy,
}

impl StuckNodeSweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, policy: StalePolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }

    /// Run one pass over every stuck node.
    ///
    /// Only listing the stuck nodes can fail the pass; a node that cannot be
    /// reclaimed is counted and skipped.
    pub async fn sweep_once(&self) -> Result<SweepStats, DbError> {
        let cutoff = self.policy.cutoff(Utc::now());
        let stuck = self.orchestrator.store().list_stuck(cutoff).await?;

        let mut stats = SweepStats {
            examined: stuck.len(),
            ..SweepStats::default()
        };

        for node in &stuck {
            match self.orchestrator.reclaim(node).await {
                Ok(_) => stats.reclaimed += 1,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to reclaim stuck node");
                    stats.failed += 1;
                }
            }
        }

        debug!(?stats, "Sweep pass complete");
        Ok(stats)
    }
}
