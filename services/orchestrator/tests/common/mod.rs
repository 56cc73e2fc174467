//! Shared fixtures: scripted providers, a fault-injecting store, and a
//! recording alert sink wired into an orchestrator.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hoster_id::NodeId;
use hoster_orchestrator::db::{Activation, CapacityStore, DbError, MemoryNodeStore};
use hoster_orchestrator::node::{
    ClassLabel, Demand, Node, NodeStatus, PlacementRequest, Provider, Workload,
};
use hoster_orchestrator::orchestrator::{
    OrphanAlert, OrphanAlertSink, Orchestrator, OrchestratorConfig,
};
use hoster_orchestrator::providers::{
    ComputeInstance, ComputeProvisioner, DnsRecordSpec, DnsRegistrar, InstanceSpec,
    ProviderError, ServerCatalog, ServerType,
};
use hoster_reconcile::RetryPolicy;

pub const ZONE: &str = "zone-1";
pub const BASE_DOMAIN: &str = "example.net";

// =============================================================================
// Compute
// =============================================================================

/// How the next create call behaves.
#[derive(Debug, Clone)]
pub enum CreateScript {
    Fail(ProviderError),
    /// The instance is created but the caller gets an error back.
    CreateThenFail(ProviderError),
    /// Never answers.
    Hang,
}

/// In-memory compute provider with scripted failures.
#[derive(Default)]
pub struct FakeCompute {
    creates: Mutex<VecDeque<CreateScript>>,
    deletes: Mutex<VecDeque<ProviderError>>,
    /// instance id -> name
    instances: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeCompute {
    pub fn script_create(&self, script: CreateScript) {
        self.creates.lock().unwrap().push_back(script);
    }

    /// The next `times` delete calls (by id or by name) fail with `err`.
    pub fn fail_deletes(&self, err: ProviderError, times: usize) {
        let mut deletes = self.deletes.lock().unwrap();
        for _ in 0..times {
            deletes.push_back(err.clone());
        }
    }

    /// An instance that exists at the provider without the orchestrator
    /// having heard about it.
    pub fn seed_instance(&self, name: &str) -> String {
        self.allocate(name)
    }

    pub fn live_instances(&self) -> Vec<(String, String)> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn allocate(&self, name: &str) -> String {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1000).to_string();
        self.instances
            .lock()
            .unwrap()
            .insert(id.clone(), name.to_string());
        id
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_delete_failure(&self) -> Option<ProviderError> {
        self.deletes.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl ComputeProvisioner for FakeCompute {
    fn provider(&self) -> Provider {
        Provider::Hcloud
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<ComputeInstance, ProviderError> {
        self.record(format!("create:{}", spec.name));
        let script = self.creates.lock().unwrap().pop_front();
        match script {
            Some(CreateScript::Fail(err)) => Err(err),
            Some(CreateScript::CreateThenFail(err)) => {
                self.allocate(&spec.name);
                Err(err)
            }
            Some(CreateScript::Hang) => {
                self.allocate(&spec.name);
                std::future::pending().await
            }
            None => {
                let id = self.allocate(&spec.name);
                let last = id.parse::<u64>().unwrap_or(0) % 250;
                Ok(ComputeInstance {
                    instance_id: id,
                    name: spec.name.clone(),
                    public_ipv4: Ipv4Addr::new(203, 0, 113, last as u8),
                })
            }
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.record(format!("delete:{instance_id}"));
        if let Some(err) = self.next_delete_failure() {
            return Err(err);
        }
        self.instances.lock().unwrap().remove(instance_id);
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool, ProviderError> {
        self.record(format!("delete_by_name:{name}"));
        if let Some(err) = self.next_delete_failure() {
            return Err(err);
        }
        let mut instances = self.instances.lock().unwrap();
        let before = instances.len();
        instances.retain(|_, n| n != name);
        Ok(instances.len() != before)
    }
}

// =============================================================================
// DNS
// =============================================================================

/// In-memory DNS registrar with scripted failures.
#[derive(Default)]
pub struct FakeDns {
    creates: Mutex<VecDeque<CreateScript>>,
    deletes: Mutex<VecDeque<ProviderError>>,
    /// record id -> (zone, name, address)
    records: Mutex<BTreeMap<String, (String, String, Ipv4Addr)>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeDns {
    pub fn script_create(&self, script: CreateScript) {
        self.creates.lock().unwrap().push_back(script);
    }

    pub fn fail_creates(&self, err: ProviderError, times: usize) {
        for _ in 0..times {
            self.script_create(CreateScript::Fail(err.clone()));
        }
    }

    pub fn fail_deletes(&self, err: ProviderError, times: usize) {
        let mut deletes = self.deletes.lock().unwrap();
        for _ in 0..times {
            deletes.push_back(err.clone());
        }
    }

    pub fn live_records(&self) -> Vec<(String, String)> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (_, name, _))| (id.clone(), name.clone()))
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn allocate(&self, record: &DnsRecordSpec) -> String {
        let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().unwrap().insert(
            id.clone(),
            (record.zone.clone(), record.name.clone(), record.address),
        );
        id
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DnsRegistrar for FakeDns {
    async fn create_record(&self, record: &DnsRecordSpec) -> Result<String, ProviderError> {
        self.record(format!("create:{}", record.name));
        let script = self.creates.lock().unwrap().pop_front();
        match script {
            Some(CreateScript::Fail(err)) => Err(err),
            Some(CreateScript::CreateThenFail(err)) => {
                self.allocate(record);
                Err(err)
            }
            Some(CreateScript::Hang) => {
                self.allocate(record);
                std::future::pending().await
            }
            None => Ok(self.allocate(record)),
        }
    }

    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), ProviderError> {
        self.record(format!("delete:{zone}/{record_id}"));
        if let Some(err) = self.deletes.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.records.lock().unwrap().remove(record_id);
        Ok(())
    }

    async fn delete_record_by_name(&self, zone: &str, name: &str) -> Result<bool, ProviderError> {
        self.record(format!("delete_by_name:{zone}/{name}"));
        if let Some(err) = self.deletes.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, (z, n, _)| !(z == zone && n == name));
        Ok(records.len() != before)
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<OrphanAlert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<OrphanAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl OrphanAlertSink for RecordingAlerts {
    fn raise(&self, alert: &OrphanAlert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

// =============================================================================
// Store
// =============================================================================

/// Memory store with switchable failures.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryNodeStore,
    pub fail_insert: AtomicBool,
    pub fail_mark_pending: AtomicBool,
    pub fail_activate: AtomicBool,
}

impl FlakyStore {
    fn check(flag: &AtomicBool) -> Result<(), DbError> {
        if flag.load(Ordering::SeqCst) {
            Err(DbError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CapacityStore for FlakyStore {
    async fn best_fit(&self, demand: Demand) -> Result<Option<Node>, DbError> {
        self.inner.best_fit(demand).await
    }

    async fn atomic_decrement(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        // Widen the window between ranking and decrementing.
        tokio::task::yield_now().await;
        self.inner.atomic_decrement(id, demand).await
    }

    async fn release(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        self.inner.release(id, demand).await
    }

    async fn insert(&self, node: &Node) -> Result<(), DbError> {
        Self::check(&self.fail_insert)?;
        self.inner.insert(node).await
    }

    async fn get(&self, id: NodeId) -> Result<Node, DbError> {
        self.inner.get(id).await
    }

    async fn list(&self, status: Option<NodeStatus>) -> Result<Vec<Node>, DbError> {
        self.inner.list(status).await
    }

    async fn mark_pending(
        &self,
        id: NodeId,
        instance_id: &str,
        public_ipv4: Ipv4Addr,
    ) -> Result<Node, DbError> {
        Self::check(&self.fail_mark_pending)?;
        self.inner.mark_pending(id, instance_id, public_ipv4).await
    }

    async fn record_dns(
        &self,
        id: NodeId,
        dns_name: &str,
        dns_record_id: Option<&str>,
    ) -> Result<Node, DbError> {
        self.inner.record_dns(id, dns_name, dns_record_id).await
    }

    async fn activate(&self, id: NodeId, activation: &Activation) -> Result<Node, DbError> {
        Self::check(&self.fail_activate)?;
        self.inner.activate(id, activation).await
    }

    async fn mark_stopped(&self, id: NodeId) -> Result<Node, DbError> {
        self.inner.mark_stopped(id).await
    }

    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Node>, DbError> {
        self.inner.list_stuck(older_than).await
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<FlakyStore>,
    pub compute: Arc<FakeCompute>,
    pub dns: Arc<FakeDns>,
    pub alerts: Arc<RecordingAlerts>,
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(ZONE, BASE_DOMAIN);
    config.retry = RetryPolicy::immediate(3);
    config.call_timeout = Duration::from_millis(200);
    config.fit_max_attempts = 10;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let compute = Arc::new(FakeCompute::default());
        let dns = Arc::new(FakeDns::default());
        let alerts = Arc::new(RecordingAlerts::default());

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            compute.clone(),
            dns.clone(),
            alerts.clone(),
            ServerCatalog::builtin(),
            config,
        ));

        Self {
            orchestrator,
            store,
            compute,
            dns,
            alerts,
        }
    }

    /// Insert a `Well` node with the given totals and free counters.
    pub async fn seed_well_node(&self, total: (i64, i32), free: (i64, i32)) -> NodeId {
        let mut node = reserved_node(ServerType::new("seed", total.1, total.0));
        node.status = NodeStatus::Well;
        node.capacity.free_mem = free.0;
        node.capacity.free_cpu = free.1;
        node.dns_name = Some(format!("seed.game.{BASE_DOMAIN}"));
        self.store.inner.insert(&node).await.unwrap();
        node.id
    }

    pub async fn node(&self, id: NodeId) -> Node {
        self.store.inner.get(id).await.unwrap()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.store.inner.list(None).await.unwrap()
    }
}

pub fn reserved_node(server_type: ServerType) -> Node {
    let workload = Workload {
        demand: Demand::new(1, 1).unwrap(),
        workload_class: ClassLabel::parse("workload_class", "game").unwrap(),
        size_class: ClassLabel::parse("size_class", "small").unwrap(),
    };
    Node::reserve(NodeId::new(), Provider::Hcloud, &workload, &server_type, "fsn1")
}

pub fn request(mem: i64, cpu: i32) -> PlacementRequest {
    PlacementRequest {
        requested_mem: mem,
        requested_cpu: cpu,
        workload_class: "game".to_string(),
        size_class: "small".to_string(),
    }
}
