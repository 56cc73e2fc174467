//! In-memory capacity store.
//!
//! Same semantics as the Postgres store. Every operation takes the lock
//! once, so each one is atomic with respect to the others. The lock is
//! never held across an await point.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hoster_id::NodeId;

use super::{Activation, CapacityStore, DbError};
use crate::node::{Capacity, Demand, Node, NodeStatus};

/// Mutex-guarded map of nodes.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeId, Node>> {
        // A panicking test thread must not wedge every other caller.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(
        &self,
        id: NodeId,
        to: NodeStatus,
        apply: impl FnOnce(&mut Node) -> Result<(), DbError>,
    ) -> Result<Node, DbError> {
        let mut nodes = self.lock();
        let node = nodes.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if !node.status.can_transition_to(to) {
            return Err(DbError::InvalidTransition {
                id,
                from: node.status,
                to,
            });
        }

        let mut updated = node.clone();
        apply(&mut updated)?;
        updated.status = to;
        updated.updated_at = Utc::now();
        *node = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl CapacityStore for MemoryNodeStore {
    async fn best_fit(&self, demand: Demand) -> Result<Option<Node>, DbError> {
        let nodes = self.lock();
        let best = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Well && n.capacity.fits(demand))
            .max_by(|a, b| {
                a.capacity
                    .free_mem
                    .cmp(&b.capacity.free_mem)
                    .then(a.capacity.free_cpu.cmp(&b.capacity.free_cpu))
                    // Smaller id wins a tie.
                    .then(b.id.cmp(&a.id))
            })
            .cloned();
        Ok(best)
    }

    async fn atomic_decrement(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        let mut nodes = self.lock();
        let node = nodes.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if node.status != NodeStatus::Well {
            return Err(DbError::InsufficientCapacity(id));
        }
        let capacity = node
            .capacity
            .reserve(demand)
            .ok_or(DbError::InsufficientCapacity(id))?;

        node.capacity = capacity;
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn release(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        let mut nodes = self.lock();
        let node = nodes.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if node.status != NodeStatus::Well {
            return Err(DbError::NotWell {
                id,
                status: node.status,
            });
        }
        let capacity = node
            .capacity
            .release(demand)
            .ok_or(DbError::CapacityOverflow(id))?;

        node.capacity = capacity;
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn insert(&self, node: &Node) -> Result<(), DbError> {
        let mut nodes = self.lock();
        if nodes.contains_key(&node.id) {
            return Err(DbError::DuplicateIdentity(node.id.to_string()));
        }
        if nodes
            .values()
            .any(|n| n.provider == node.provider && n.name == node.name)
        {
            return Err(DbError::DuplicateIdentity(node.name.clone()));
        }
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get(&self, id: NodeId) -> Result<Node, DbError> {
        self.lock().get(&id).cloned().ok_or(DbError::NotFound(id))
    }

    async fn list(&self, status: Option<NodeStatus>) -> Result<Vec<Node>, DbError> {
        let mut nodes: Vec<Node> = self
            .lock()
            .values()
            .filter(|n| status.is_none_or(|s| n.status == s))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn mark_pending(
        &self,
        id: NodeId,
        instance_id: &str,
        public_ipv4: Ipv4Addr,
    ) -> Result<Node, DbError> {
        self.transition(id, NodeStatus::Pending, |node| {
            node.instance_id = Some(instance_id.to_string());
            node.public_ipv4 = Some(public_ipv4);
            Ok(())
        })
    }

    async fn record_dns(
        &self,
        id: NodeId,
        dns_name: &str,
        dns_record_id: Option<&str>,
    ) -> Result<Node, DbError> {
        let mut nodes = self.lock();
        let node = nodes.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if node.status != NodeStatus::Pending {
            return Err(DbError::InvalidTransition {
                id,
                from: node.status,
                to: NodeStatus::Pending,
            });
        }

        node.dns_name = Some(dns_name.to_string());
        node.dns_record_id = dns_record_id.map(str::to_string);
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn activate(&self, id: NodeId, activation: &Activation) -> Result<Node, DbError> {
        self.transition(id, NodeStatus::Well, |node| {
            let fresh = Capacity::new(node.capacity.total_mem, node.capacity.total_cpu);
            node.capacity = fresh
                .reserve(activation.demand)
                .ok_or(DbError::InsufficientCapacity(id))?;
            node.dns_name = Some(activation.dns_name.clone());
            node.dns_record_id = Some(activation.dns_record_id.clone());
            Ok(())
        })
    }

    async fn mark_stopped(&self, id: NodeId) -> Result<Node, DbError> {
        self.transition(id, NodeStatus::Stopped, |_| Ok(()))
    }

    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Node>, DbError> {
        let mut nodes: Vec<Node> = self
            .lock()
            .values()
            .filter(|n| n.status.is_transient() && n.updated_at < older_than)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::{ClassLabel, Provider, Workload};
    use crate::providers::ServerType;

    fn demand(mem: i64, cpu: i32) -> Demand {
        Demand::new(mem, cpu).unwrap()
    }

    fn workload() -> Workload {
        Workload {
            demand: demand(1, 1),
            workload_class: ClassLabel::parse("workload_class", "game").unwrap(),
            size_class: ClassLabel::parse("size_class", "small").unwrap(),
        }
    }

    /// Inserts a `Well` node with the given counters.
    async fn well_node(store: &MemoryNodeStore, total: (i64, i32), free: (i64, i32)) -> NodeId {
        let server_type = ServerType::new("test", total.1, total.0);
        let mut node = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &server_type,
            "fsn1",
        );
        node.status = NodeStatus::Well;
        node.capacity.free_mem = free.0;
        node.capacity.free_cpu = free.1;
        store.insert(&node).await.unwrap();
        node.id
    }

    #[tokio::test]
    async fn test_best_fit_prefers_most_free() {
        let store = MemoryNodeStore::new();
        let _small = well_node(&store, (8, 4), (4, 2)).await;
        let large = well_node(&store, (16, 4), (12, 1)).await;
        let _no_cpu = well_node(&store, (16, 8), (12, 0)).await;

        let best = store.best_fit(demand(2, 1)).await.unwrap().unwrap();
        assert_eq!(best.id, large);
    }

    #[tokio::test]
    async fn test_best_fit_tie_breaks_on_id() {
        let store = MemoryNodeStore::new();
        let a = well_node(&store, (8, 4), (4, 2)).await;
        let b = well_node(&store, (8, 4), (4, 2)).await;

        let best = store.best_fit(demand(1, 1)).await.unwrap().unwrap();
        assert_eq!(best.id, a.min(b));
    }

    #[tokio::test]
    async fn test_best_fit_ignores_non_well() {
        let store = MemoryNodeStore::new();
        let id = well_node(&store, (8, 4), (8, 4)).await;
        store.mark_stopped(id).await.unwrap();

        assert!(store.best_fit(demand(1, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_atomic_decrement() {
        let store = MemoryNodeStore::new();
        let id = well_node(&store, (8, 4), (4, 2)).await;

        let node = store.atomic_decrement(id, demand(2, 1)).await.unwrap();
        assert_eq!((node.capacity.free_mem, node.capacity.free_cpu), (2, 1));

        let err = store.atomic_decrement(id, demand(4, 1)).await.unwrap_err();
        assert!(matches!(err, DbError::InsufficientCapacity(_)));

        let err = store
            .atomic_decrement(NodeId::new(), demand(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_decrements_never_overbook() {
        let store = Arc::new(MemoryNodeStore::new());
        let id = well_node(&store, (10, 10), (10, 10)).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.atomic_decrement(id, demand(1, 1)).await.is_ok()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        let node = store.get(id).await.unwrap();
        assert_eq!(node.capacity.free_mem, 0);
        assert!(node.capacity.is_consistent());
    }

    #[tokio::test]
    async fn test_release_overflow() {
        let store = MemoryNodeStore::new();
        let id = well_node(&store, (8, 4), (6, 3)).await;

        let node = store.release(id, demand(2, 1)).await.unwrap();
        assert_eq!(node.capacity, Capacity::new(8, 4));

        let err = store.release(id, demand(1, 1)).await.unwrap_err();
        assert!(matches!(err, DbError::CapacityOverflow(_)));
    }

    #[tokio::test]
    async fn test_release_requires_well() {
        let store = MemoryNodeStore::new();
        let id = well_node(&store, (8, 4), (6, 3)).await;
        store.mark_stopped(id).await.unwrap();

        let err = store.release(id, demand(2, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::NotWell {
                status: NodeStatus::Stopped,
                ..
            }
        ));
        let node = store.get(id).await.unwrap();
        assert_eq!((node.capacity.free_mem, node.capacity.free_cpu), (6, 3));
    }

    #[tokio::test]
    async fn test_record_dns_only_on_pending() {
        let store = MemoryNodeStore::new();
        let node = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &ServerType::new("cax11", 2, 4096),
            "fsn1",
        );
        store.insert(&node).await.unwrap();

        let err = store
            .record_dns(node.id, "abc.game.example.net", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));

        store
            .mark_pending(node.id, "4711", Ipv4Addr::new(203, 0, 113, 7))
            .await
            .unwrap();
        let named = store
            .record_dns(node.id, "abc.game.example.net", None)
            .await
            .unwrap();
        assert_eq!(named.status, NodeStatus::Pending);
        assert_eq!(named.dns_name.as_deref(), Some("abc.game.example.net"));
        assert_eq!(named.dns_record_id, None);

        let recorded = store
            .record_dns(node.id, "abc.game.example.net", Some("rec-1"))
            .await
            .unwrap();
        assert_eq!(recorded.dns_record_id.as_deref(), Some("rec-1"));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = MemoryNodeStore::new();
        let node = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &ServerType::new("cax11", 2, 4096),
            "fsn1",
        );
        store.insert(&node).await.unwrap();

        let err = store.insert(&node).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateIdentity(_)));

        let mut same_name = node.clone();
        same_name.id = NodeId::new();
        let err = store.insert(&same_name).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateIdentity(_)));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryNodeStore::new();
        let node = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &ServerType::new("cax11", 2, 4096),
            "fsn1",
        );
        store.insert(&node).await.unwrap();

        let activation = Activation {
            dns_name: "abc.game.example.net".to_string(),
            dns_record_id: "rec-1".to_string(),
            demand: demand(1024, 1),
        };
        let err = store.activate(node.id, &activation).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition {
                from: NodeStatus::Starting,
                to: NodeStatus::Well,
                ..
            }
        ));

        let pending = store
            .mark_pending(node.id, "4711", Ipv4Addr::new(203, 0, 113, 7))
            .await
            .unwrap();
        assert_eq!(pending.status, NodeStatus::Pending);
        assert_eq!(pending.instance_id.as_deref(), Some("4711"));

        let well = store.activate(node.id, &activation).await.unwrap();
        assert_eq!(well.status, NodeStatus::Well);
        assert_eq!(
            (well.capacity.free_mem, well.capacity.free_cpu),
            (3072, 1)
        );
        assert_eq!(well.dns_name.as_deref(), Some("abc.game.example.net"));
        assert!(well.updated_at >= node.updated_at);

        let stopped = store.mark_stopped(node.id).await.unwrap();
        assert_eq!(stopped.status, NodeStatus::Stopped);
        assert!(store.mark_stopped(node.id).await.is_err());
    }

    #[tokio::test]
    async fn test_activate_rejects_oversized_demand() {
        let store = MemoryNodeStore::new();
        let node = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &ServerType::new("cax11", 2, 4096),
            "fsn1",
        );
        store.insert(&node).await.unwrap();
        store
            .mark_pending(node.id, "1", Ipv4Addr::LOCALHOST)
            .await
            .unwrap();

        let activation = Activation {
            dns_name: "x.game.example.net".to_string(),
            dns_record_id: "rec".to_string(),
            demand: demand(8192, 1),
        };
        let err = store.activate(node.id, &activation).await.unwrap_err();
        assert!(matches!(err, DbError::InsufficientCapacity(_)));
        assert_eq!(store.get(node.id).await.unwrap().status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_and_list_stuck() {
        let store = MemoryNodeStore::new();
        let well = well_node(&store, (8, 4), (8, 4)).await;
        let starting = Node::reserve(
            NodeId::new(),
            Provider::Hcloud,
            &workload(),
            &ServerType::new("cax11", 2, 4096),
            "fsn1",
        );
        store.insert(&starting).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_well = store.list(Some(NodeStatus::Well)).await.unwrap();
        assert_eq!(only_well.len(), 1);
        assert_eq!(only_well[0].id, well);

        let future = Utc::now() + chrono::Duration::seconds(1);
        let stuck = store.list_stuck(future).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, starting.id);

        let past = Utc::now() - chrono::Duration::minutes(15);
        assert!(store.list_stuck(past).await.unwrap().is_empty());
    }
}
