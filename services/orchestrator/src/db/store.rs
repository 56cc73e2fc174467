//! The capacity store seam.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hoster_id::NodeId;

use super::DbError;
use crate::node::{Demand, Node, NodeStatus};

/// What `activate` writes when a node goes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub dns_name: String,
    pub dns_record_id: String,
    /// Demand of the workload that caused the node to be provisioned.
    /// Free counters become `total - demand`.
    pub demand: Demand,
}

/// Durable record of every node.
///
/// Implementations must make `atomic_decrement`, `insert`, and the status
/// transitions safe under concurrent callers without in-process
/// coordination: correctness comes from the store's own concurrency control.
#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Highest-ranked `Well` node able to host `demand`.
    ///
    /// Ranking is `free_mem DESC, free_cpu DESC, node_id ASC`. Read-only;
    /// the result may be stale by the time the caller acts on it.
    async fn best_fit(&self, demand: Demand) -> Result<Option<Node>, DbError>;

    /// Take `demand` from a `Well` node if it still fits.
    async fn atomic_decrement(&self, id: NodeId, demand: Demand) -> Result<Node, DbError>;

    /// Give `demand` back to a `Well` node.
    async fn release(&self, id: NodeId, demand: Demand) -> Result<Node, DbError>;

    async fn insert(&self, node: &Node) -> Result<(), DbError>;

    async fn get(&self, id: NodeId) -> Result<Node, DbError>;

    /// Nodes ordered by creation time, optionally filtered by status.
    async fn list(&self, status: Option<NodeStatus>) -> Result<Vec<Node>, DbError>;

    /// `Starting -> Pending`, recording the compute instance.
    async fn mark_pending(
        &self,
        id: NodeId,
        instance_id: &str,
        public_ipv4: Ipv4Addr,
    ) -> Result<Node, DbError>;

    /// Record the DNS name of a `Pending` node, and the record id once the
    /// registrar has returned one. The status is unchanged.
    async fn record_dns(
        &self,
        id: NodeId,
        dns_name: &str,
        dns_record_id: Option<&str>,
    ) -> Result<Node, DbError>;

    /// `Pending -> Well`, recording DNS and the first workload's demand.
    async fn activate(&self, id: NodeId, activation: &Activation) -> Result<Node, DbError>;

    /// Any non-terminal status -> `Stopped`.
    async fn mark_stopped(&self, id: NodeId) -> Result<Node, DbError>;

    /// `Starting`/`Pending` nodes not updated since `older_than`.
    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Node>, DbError>;

    async fn health_check(&self) -> Result<(), DbError>;
}
