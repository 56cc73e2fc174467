//! The provisioning workflow.
//!
//! ```text
//! INIT -> COMPUTE_REQUESTED -> COMPUTE_READY -> DNS_REQUESTED -> DNS_READY -> PERSISTED
//!   any state -> FAILED
//! ```
//!
//! Before any provider call the node row is reserved in `Starting`, so a
//! crash mid-workflow leaves a record the reconciliation sweep can find.
//! The DNS name is stored before the record is requested and the record id
//! as soon as it is known.
//! On failure every external resource created so far is deleted, DNS first.
//! A failed delete becomes an orphan alert and the attempt ends in
//! `RollbackFailed`.

use hoster_id::NodeId;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::call::call_provider;
use super::{OrphanAlert, OrphanResource, Orchestrator, PlacementError, Stage};
use crate::db::Activation;
use crate::node::{Node, Workload};
use crate::providers::{CallKind, ComputeInstance, DnsRecordSpec, InstanceSpec, ProviderError};

/// Progress of a single provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Init,
    ComputeRequested,
    ComputeReady,
    DnsRequested,
    DnsReady,
    Persisted,
    Failed,
}

/// What one attempt has created so far.
#[derive(Debug)]
struct Attempt {
    node: Node,
    state: ProvisionState,
    instance: Option<ComputeInstance>,
    /// A create may have produced an instance we never heard back about.
    compute_uncertain: bool,
    dns_name: Option<String>,
    record_id: Option<String>,
    dns_uncertain: bool,
}

impl Attempt {
    fn new(node: Node) -> Self {
        Self {
            node,
            state: ProvisionState::Init,
            instance: None,
            compute_uncertain: false,
            dns_name: None,
            record_id: None,
            dns_uncertain: false,
        }
    }

    fn advance(&mut self, next: ProvisionState) {
        debug!(node_id = %self.node.id, from = ?self.state, to = ?next, "Provisioning state change");
        self.state = next;
    }
}

impl Orchestrator {
    /// Create a node for `workload` end to end, or fail cleanly.
    pub(super) async fn provision(&self, workload: &Workload) -> Result<Node, PlacementError> {
        let Some(server_type) = self.catalog.select(workload.demand) else {
            return Err(PlacementError::ProviderRejected {
                stage: Stage::Compute,
                message: format!(
                    "no server type offers {} MiB and {} vCPU",
                    workload.demand.mem, workload.demand.cpu
                ),
            });
        };

        let node = Node::reserve(
            NodeId::new(),
            self.compute.provider(),
            workload,
            server_type,
            &self.config.location,
        );
        self.store
            .insert(&node)
            .await
            .map_err(|e| PlacementError::persistence(Stage::Reserve, e))?;
        info!(
            node_id = %node.id,
            name = %node.name,
            server_type = %node.server_type,
            "Reserved node"
        );

        let mut attempt = Attempt::new(node);

        // Compute.
        attempt.advance(ProvisionState::ComputeRequested);
        let spec = InstanceSpec {
            name: attempt.node.name.clone(),
            server_type: attempt.node.server_type.clone(),
            location: attempt.node.location.clone(),
            image: self.config.image.clone(),
            labels: attempt.node.labels.clone(),
        };
        let mut sends = 0u32;
        let created = call_provider(
            &self.config.retry,
            self.config.call_timeout,
            CallKind::Create,
            "compute.create",
            || {
                sends += 1;
                self.compute.create(&spec)
            },
        )
        .await;
        let instance = match created {
            Ok(instance) => instance,
            Err(err) => {
                attempt.compute_uncertain = may_have_created(sends, &err);
                let cause = PlacementError::provider(Stage::Compute, err);
                return Err(self.abort(attempt, Stage::Compute, cause).await);
            }
        };
        attempt.instance = Some(instance.clone());
        attempt.advance(ProvisionState::ComputeReady);

        if let Err(e) = self
            .store
            .mark_pending(attempt.node.id, &instance.instance_id, instance.public_ipv4)
            .await
        {
            let cause = PlacementError::persistence(Stage::Compute, e);
            return Err(self.abort(attempt, Stage::Compute, cause).await);
        }

        // DNS.
        attempt.advance(ProvisionState::DnsRequested);
        let dns_name = format!(
            "{}.{}.{}",
            Uuid::new_v4(),
            workload.workload_class,
            self.config.base_domain
        );
        // The name is stored before the record exists so a sweep can find
        // the record even if its id is never returned.
        if let Err(e) = self.store.record_dns(attempt.node.id, &dns_name, None).await {
            let cause = PlacementError::persistence(Stage::Dns, e);
            return Err(self.abort(attempt, Stage::Dns, cause).await);
        }
        attempt.dns_name = Some(dns_name.clone());

        let record = DnsRecordSpec {
            zone: self.config.dns_zone.clone(),
            name: dns_name.clone(),
            address: instance.public_ipv4,
            ttl: self.config.dns_ttl,
        };
        let mut sends = 0u32;
        let registered = call_provider(
            &self.config.retry,
            self.config.call_timeout,
            CallKind::Create,
            "dns.create_record",
            || {
                sends += 1;
                let retrying = sends > 1;
                let (dns, record) = (&self.dns, &record);
                async move {
                    // A failed earlier attempt may still have created the record.
                    if retrying {
                        dns.delete_record_by_name(&record.zone, &record.name).await?;
                    }
                    dns.create_record(record).await
                }
            },
        )
        .await;
        let record_id = match registered {
            Ok(record_id) => record_id,
            Err(err) => {
                attempt.dns_uncertain = may_have_created(sends, &err);
                let cause = PlacementError::provider(Stage::Dns, err);
                return Err(self.abort(attempt, Stage::Dns, cause).await);
            }
        };
        attempt.record_id = Some(record_id.clone());

        if let Err(e) = self
            .store
            .record_dns(attempt.node.id, &dns_name, Some(&record_id))
            .await
        {
            let cause = PlacementError::persistence(Stage::Dns, e);
            return Err(self.abort(attempt, Stage::Dns, cause).await);
        }
        attempt.advance(ProvisionState::DnsReady);

        // Persist.
        let activation = Activation {
            dns_name,
            dns_record_id: record_id,
            demand: workload.demand,
        };
        match self.store.activate(attempt.node.id, &activation).await {
            Ok(node) => {
                attempt.advance(ProvisionState::Persisted);
                info!(
                    node_id = %node.id,
                    instance_id = ?node.instance_id,
                    dns_name = ?node.dns_name,
                    "Node provisioned"
                );
                Ok(node)
            }
            Err(e) => {
                let cause = PlacementError::persistence(Stage::Persist, e);
                Err(self.abort(attempt, Stage::Persist, cause).await)
            }
        }
    }

    /// Undo everything `attempt` created and pick the error to return.
    async fn abort(&self, mut attempt: Attempt, stage: Stage, cause: PlacementError) -> PlacementError {
        attempt.advance(ProvisionState::Failed);
        warn!(
            node_id = %attempt.node.id,
            %stage,
            error = %cause,
            "Provisioning failed, compensating"
        );

        let mut orphans = Vec::new();
        let zone = &self.config.dns_zone;

        if let Some(name) = attempt.dns_name.as_deref() {
            let outcome = match attempt.record_id.as_deref() {
                Some(record_id) => Some(
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
                None if attempt.dns_uncertain => Some(
                    call_provider(
                        &self.config.retry,
                        self.config.call_timeout,
                        CallKind::Delete,
                        "dns.delete_record_by_name",
                        || self.dns.delete_record_by_name(zone, name),
                    )
                    .await,
                ),
                None => None,
            };

            if let Some(Err(err)) = outcome {
                orphans.push(self.orphaned(
                    &attempt,
                    stage,
                    OrphanResource::DnsRecord {
                        zone: zone.clone(),
                        record_id: attempt.record_id.clone(),
                        name: name.to_string(),
                    },
                    err,
                ));
            }
        }

        let name = attempt.node.name.as_str();
        let outcome = match attempt.instance.as_ref() {
            Some(instance) => Some(
                call_provider(
                    &self.config.retry,
                    self.config.call_timeout,
                    CallKind::Delete,
                    "compute.delete",
                    || self.compute.delete(&instance.instance_id),
                )
                .await
                .map(|()| true),
            ),
            None if attempt.compute_uncertain => Some(
                call_provider(
                    &self.config.retry,
                    self.config.call_timeout,
                    CallKind::Delete,
                    "compute.delete_by_name",
                    || self.compute.delete_by_name(name),
                )
                .await,
            ),
            None => None,
        };

        match outcome {
            Some(Err(err)) => {
                orphans.push(self.orphaned(
                    &attempt,
                    stage,
                    OrphanResource::Instance {
                        instance_id: attempt.instance.as_ref().map(|i| i.instance_id.clone()),
                        name: name.to_string(),
                    },
                    err,
                ));
            }
            Some(Ok(found)) => {
                debug!(node_id = %attempt.node.id, found, "Compute compensation complete");
            }
            None => {}
        }

        if !orphans.is_empty() {
            // The row stays transient so the sweep retries the cleanup.
            return PlacementError::RollbackFailed {
                stage,
                cause: cause.to_string(),
                orphans,
            };
        }

        if let Err(e) = self.store.mark_stopped(attempt.node.id).await {
            warn!(
                node_id = %attempt.node.id,
                error = %e,
                "Could not retire reserved node; the sweep will retire it"
            );
        }
        info!(node_id = %attempt.node.id, %stage, "Rollback complete");
        cause
    }

    fn orphaned(
        &self,
        attempt: &Attempt,
        stage: Stage,
        resource: OrphanResource,
        err: ProviderError,
    ) -> OrphanResource {
        self.alerts.raise(&OrphanAlert {
            node_id: attempt.node.id,
            stage,
            resource: resource.clone(),
            reason: err.to_string(),
        });
        resource
    }
}

/// Whether a failed create may still have produced the resource.
///
/// Only a single request refused outright is known to have done nothing.
/// A 5xx can arrive after the provider acted, and a retry of such a call
/// then fails on the name it already took.
fn may_have_created(sends: u32, err: &ProviderError) -> bool {
    !(sends == 1 && matches!(err, ProviderError::Rejected(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, ProviderError::Rejected("422".into()), false)]
    #[case(1, ProviderError::Transient("502".into()), true)]
    #[case(1, ProviderError::Ambiguous("reset".into()), true)]
    #[case(2, ProviderError::Rejected("409 uniqueness_error".into()), true)]
    #[case(3, ProviderError::Transient("503".into()), true)]
    fn test_may_have_created(
        #[case] sends: u32,
        #[case] err: ProviderError,
        #[case] expected: bool,
    ) {
        assert_eq!(may_have_created(sends, &err), expected);
    }
}
