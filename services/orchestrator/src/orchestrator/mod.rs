//! Node allocation and provisioning.
//!
//! [`Orchestrator::place_workload`] is the single entry point:
//!
//! 1. The [`FitSelector`] tries to take capacity from an existing `Well`
//!    node.
//! 2. On a miss, the provisioning workflow creates a compute instance,
//!    registers DNS for it, and activates the node row, compensating in
//!    reverse order when a later step fails.
//!
//! All collaborators are injected at construction time.

mod alerts;
mod call;
mod error;
mod fit;
mod provision;
mod teardown;

pub use alerts::{LogAlertSink, OrphanAlert, OrphanAlertSink, OrphanResource};
pub use error::{PlacementError, Stage};
pub use fit::{FitOutcome, FitSelector};
pub use provision::ProvisionState;

use std::sync::Arc;
use std::time::Duration;

use hoster_id::{NodeId, RequestId};
use hoster_reconcile::RetryPolicy;
use serde::Serialize;
use tracing::{info, instrument};

use crate::db::CapacityStore;
use crate::node::{Demand, Node, NodeStatus, PlacementRequest, Workload};
use crate::providers::{ComputeProvisioner, DnsRegistrar, ServerCatalog};

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Provider location new instances are created in.
    pub location: String,
    pub image: String,
    /// DNS zone records are created in.
    pub dns_zone: String,
    /// Suffix of every node's DNS name.
    pub base_domain: String,
    pub dns_ttl: u32,
    /// Upper bound for a single provider call.
    pub call_timeout: Duration,
    /// Retry policy for transient provider failures, compensations included.
    pub retry: RetryPolicy,
    /// Selection attempts before contention is reported.
    pub fit_max_attempts: u32,
}

impl OrchestratorConfig {
    pub const DEFAULT_LOCATION: &'static str = "fsn1";
    pub const DEFAULT_IMAGE: &'static str = "ubuntu-22.04";
    pub const DEFAULT_DNS_TTL: u32 = 120;
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_FIT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(dns_zone: impl Into<String>, base_domain: impl Into<String>) -> Self {
        Self {
            location: Self::DEFAULT_LOCATION.to_string(),
            image: Self::DEFAULT_IMAGE.to_string(),
            dns_zone: dns_zone.into(),
            base_domain: base_domain.into(),
            dns_ttl: Self::DEFAULT_DNS_TTL,
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            retry: RetryPolicy::default(),
            fit_max_attempts: Self::DEFAULT_FIT_MAX_ATTEMPTS,
        }
    }
}

/// Where a placement landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementOrigin {
    /// Capacity was taken from a node that already existed.
    Existing,
    /// A node was provisioned for this workload.
    Provisioned,
}

/// Successful placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub node: Node,
    pub origin: PlacementOrigin,
}

/// The allocation and provisioning core.
pub struct Orchestrator {
    store: Arc<dyn CapacityStore>,
    compute: Arc<dyn ComputeProvisioner>,
    dns: Arc<dyn DnsRegistrar>,
    alerts: Arc<dyn OrphanAlertSink>,
    catalog: ServerCatalog,
    fit: FitSelector,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CapacityStore>,
        compute: Arc<dyn ComputeProvisioner>,
        dns: Arc<dyn DnsRegistrar>,
        alerts: Arc<dyn OrphanAlertSink>,
        catalog: ServerCatalog,
        config: OrchestratorConfig,
    ) -> Self {
        let fit = FitSelector::new(store.clone(), config.fit_max_attempts);
        Self {
            store,
            compute,
            dns,
            alerts,
            catalog,
            fit,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CapacityStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Place a workload on an existing node, or provision one for it.
    ///
    /// Returns a `Well` node whose free counters already account for the
    /// workload, or a single terminal error. Partial progress is never
    /// returned as success.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %RequestId::new(),
            workload_class = %request.workload_class,
            size_class = %request.size_class,
            mem = request.requested_mem,
            cpu = request.requested_cpu,
        )
    )]
    pub async fn place_workload(
        &self,
        request: PlacementRequest,
    ) -> Result<Placement, PlacementError> {
        let workload = Workload::try_from(request)?;

        match self.fit.find_fit(workload.demand).await? {
            FitOutcome::Placed(node) => {
                info!(node_id = %node.id, "Workload placed on existing node");
                Ok(Placement {
                    node,
                    origin: PlacementOrigin::Existing,
                })
            }
            FitOutcome::NoFit => {
                let node = self.provision(&workload).await?;
                info!(node_id = %node.id, dns_name = ?node.dns_name, "Workload placed on new node");
                Ok(Placement {
                    node,
                    origin: PlacementOrigin::Provisioned,
                })
            }
        }
    }

    /// Fit search only: take capacity from an existing node or report
    /// that none fits. Never provisions.
    pub async fn find_fit(&self, mem: i64, cpu: i32) -> Result<FitOutcome, PlacementError> {
        let demand = Demand::new(mem, cpu)?;
        self.fit.find_fit(demand).await
    }

    /// Return a departed workload's capacity to a `Well` node.
    #[instrument(skip(self))]
    pub async fn release_workload(
        &self,
        id: NodeId,
        mem: i64,
        cpu: i32,
    ) -> Result<Node, PlacementError> {
        let demand = Demand::new(mem, cpu)?;
        let node = self
            .store
            .release(id, demand)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Persist, e))?;
        info!(
            free_mem = node.capacity.free_mem,
            free_cpu = node.capacity.free_cpu,
            "Released workload capacity"
        );
        Ok(node)
    }

    pub async fn get_node(&self, id: NodeId) -> Result<Node, PlacementError> {
        self.store
            .get(id)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Select, e))
    }

    pub async fn list_nodes(&self, status: Option<NodeStatus>) -> Result<Vec<Node>, PlacementError> {
        self.store
            .list(status)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Select, e))
    }
}
