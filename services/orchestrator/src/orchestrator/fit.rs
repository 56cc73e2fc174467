//! Fit selection against existing nodes.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{PlacementError, Stage};
use crate::db::{CapacityStore, DbError};
use crate::node::{Demand, Node};

/// Result of a fit search.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// Capacity was taken from this node; the node reflects the decrement.
    Placed(Node),
    /// No `Well` node can host the demand.
    NoFit,
}

/// Picks an existing node and takes capacity from it.
///
/// Selection reads a ranking, then takes capacity with a conditional
/// decrement. A concurrent request can win the same node between the two;
/// the loser re-ranks, up to `max_attempts` times.
#[derive(Clone)]
pub struct FitSelector {
    store: Arc<dyn CapacityStore>,
    max_attempts: u32,
}

impl FitSelector {
    pub fn new(store: Arc<dyn CapacityStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn find_fit(&self, demand: Demand) -> Result<FitOutcome, PlacementError> {
        for attempt in 1..=self.max_attempts {
            let candidate = self
                .store
                .best_fit(demand)
                .await
                .map_err(|e| PlacementError::persistence(Stage::Select, e))?;

            let Some(candidate) = candidate else {
                debug!(mem = demand.mem, cpu = demand.cpu, "No fitting node");
                return Ok(FitOutcome::NoFit);
            };

            match self.store.atomic_decrement(candidate.id, demand).await {
                Ok(node) => {
                    debug!(
                        node_id = %node.id,
                        free_mem = node.capacity.free_mem,
                        free_cpu = node.capacity.free_cpu,
                        attempt,
                        "Placed on existing node"
                    );
                    return Ok(FitOutcome::Placed(node));
                }
                // Lost the race for this node, or it went away.
                Err(DbError::InsufficientCapacity(_) | DbError::NotFound(_)) => {
                    debug!(node_id = %candidate.id, attempt, "Lost selection race");
                }
                Err(e) => return Err(PlacementError::persistence(Stage::Select, e)),
            }
        }

        warn!(
            attempts = self.max_attempts,
            mem = demand.mem,
            cpu = demand.cpu,
            "Selection kept losing races"
        );
        Err(PlacementError::CapacityContention {
            attempts: self.max_attempts,
        })
    }
}
