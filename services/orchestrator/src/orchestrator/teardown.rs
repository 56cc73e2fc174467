//! Deprovisioning and reclamation of stuck nodes.

use hoster_id::NodeId;
use tracing::{info, instrument, warn};

use super::call::call_provider;
use super::{OrphanAlert, OrphanResource, Orchestrator, PlacementError, Stage};
use crate::node::{Node, NodeStatus};
use crate::providers::{CallKind, ProviderError};

/// A teardown step that failed, with the resource it left behind.
struct TeardownFailure {
    stage: Stage,
    resource: OrphanResource,
    error: ProviderError,
}

impl Orchestrator {
    /// Tear a node down: DNS record, then instance, then mark it `Stopped`.
    ///
    /// Stopped nodes are returned unchanged. On failure the node keeps its
    /// status so the call can be repeated.
    #[instrument(skip(self))]
    pub async fn deprovision(&self, id: NodeId) -> Result<Node, PlacementError> {
        let node = self.get_node(id).await?;
        if node.status == NodeStatus::Stopped {
            return Ok(node);
        }

        if let Err(failure) = self.delete_external(&node).await {
            warn!(stage = %failure.stage, error = %failure.error, "Deprovisioning failed");
            return Err(PlacementError::provider(failure.stage, failure.error));
        }

        let node = self
            .store
            .mark_stopped(id)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Persist, e))?;
        info!(name = %node.name, "Node deprovisioned");
        Ok(node)
    }

    /// Clean up after a provisioning workflow that never finished.
    ///
    /// Failures are raised as orphan alerts and the node is left in its
    /// transient status for the next sweep.
    #[instrument(skip(self, node), fields(node_id = %node.id, status = %node.status))]
    pub async fn reclaim(&self, node: &Node) -> Result<Node, PlacementError> {
        if let Err(failure) = self.delete_external(node).await {
            self.alerts.raise(&OrphanAlert {
                node_id: node.id,
                stage: failure.stage,
                resource: failure.resource,
                reason: failure.error.to_string(),
            });
            return Err(PlacementError::provider(failure.stage, failure.error));
        }

        let node = self
            .store
            .mark_stopped(node.id)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Persist, e))?;
        info!("Reclaimed stuck node");
        Ok(node)
    }

    async fn delete_external(&self, node: &Node) -> Result<(), TeardownFailure> {
        let zone = &self.config.dns_zone;

        let dns = match (node.dns_record_id.as_deref(), node.dns_name.as_deref()) {
            (Some(record_id), _) => Some(
                call_provider(
                    &self.config.retry,
                    self.config.call_timeout,
                    CallKind::Delete,
                    "dns.delete_record",
                    || self.dns.delete_record(zone, record_id),
                )
                .await
                .map(|()| true),
            ),
            // The record may exist without its id having been stored.
            (None, Some(name)) => Some(
                call_provider(
                    &self.config.retry,
                    self.config.call_timeout,
                    CallKind::Delete,
                    "dns.delete_record_by_name",
                    || self.dns.delete_record_by_name(zone, name),
                )
                .await,
            ),
            (None, None) => None,
        };

        if let Some(Err(error)) = dns {
            return Err(TeardownFailure {
                stage: Stage::Dns,
                resource: OrphanResource::DnsRecord {
                    zone: zone.clone(),
                    record_id: node.dns_record_id.clone(),
                    name: node.dns_name.clone().unwrap_or_default(),
                },
                error,
            });
        }

        let result = match node.instance_id.as_deref() {
            Some(instance_id) => call_provider(
                &self.config.retry,
                self.config.call_timeout,
                CallKind::Delete,
                "compute.delete",
                || self.compute.delete(instance_id),
            )
            .await
            .map(|()| true),
            // The create may have gone through without us recording it.
            None => {
                call_provider(
                    &self.config.retry,
                    self.config.call_timeout,
                    CallKind::Delete,
                    "compute.delete_by_name",
                    || self.compute.delete_by_name(&node.name),
                )
                .await
            }
        };

        result.map(|_| ()).map_err(|error| TeardownFailure {
            stage: Stage::Compute,
            resource: OrphanResource::Instance {
                instance_id: node.instance_id.clone(),
                name: node.name.clone(),
            },
            error,
        })
    }
}
