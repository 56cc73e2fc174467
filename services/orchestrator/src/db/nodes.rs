//! Postgres capacity store.
//!
//! Every mutation is a single conditional `UPDATE ... RETURNING`, so the
//! check and the write happen under the row lock Postgres takes for the
//! update. When no row comes back a follow-up read decides which error to
//! report; that read is advisory only.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hoster_id::NodeId;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use super::{Activation, CapacityStore, DbError};
use crate::node::{Capacity, Demand, Node, NodeStatus};

const NODE_COLUMNS: &str = "node_id, provider, name, server_type, location, workload_class, \
     size_class, status, total_mem, total_cpu, free_mem, free_cpu, instance_id, public_ipv4, \
     dns_name, dns_record_id, labels, created_at, updated_at";

/// A row from the nodes table.
#[derive(Debug, Clone)]
struct NodeRow {
    node_id: String,
    provider: String,
    name: String,
    server_type: String,
    location: String,
    workload_class: String,
    size_class: String,
    status: String,
    total_mem: i64,
    total_cpu: i32,
    free_mem: i64,
    free_cpu: i32,
    instance_id: Option<String>,
    public_ipv4: Option<String>,
    dns_name: Option<String>,
    dns_record_id: Option<String>,
    labels: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            provider: row.try_get("provider")?,
            name: row.try_get("name")?,
            server_type: row.try_get("server_type")?,
            location: row.try_get("location")?,
            workload_class: row.try_get("workload_class")?,
            size_class: row.try_get("size_class")?,
            status: row.try_get("status")?,
            total_mem: row.try_get("total_mem")?,
            total_cpu: row.try_get("total_cpu")?,
            free_mem: row.try_get("free_mem")?,
            free_cpu: row.try_get("free_cpu")?,
            instance_id: row.try_get("instance_id")?,
            public_ipv4: row.try_get("public_ipv4")?,
            dns_name: row.try_get("dns_name")?,
            dns_record_id: row.try_get("dns_record_id")?,
            labels: row.try_get("labels")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = DbError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| DbError::Corrupt {
            node_id: row.node_id.clone(),
            reason,
        };

        let id: NodeId = row.node_id.parse().map_err(|e| corrupt(format!("{e}")))?;
        let provider = row.provider.parse().map_err(|e| corrupt(format!("{e}")))?;
        let status = row.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let public_ipv4 = row
            .public_ipv4
            .as_deref()
            .map(str::parse::<Ipv4Addr>)
            .transpose()
            .map_err(|e| corrupt(format!("public_ipv4: {e}")))?;
        let labels: BTreeMap<String, String> = serde_json::from_value(row.labels.clone())
            .map_err(|e| corrupt(format!("labels: {e}")))?;

        Ok(Node {
            id,
            provider,
            name: row.name,
            server_type: row.server_type,
            location: row.location,
            workload_class: row.workload_class,
            size_class: row.size_class,
            status,
            capacity: Capacity {
                total_mem: row.total_mem,
                total_cpu: row.total_cpu,
                free_mem: row.free_mem,
                free_cpu: row.free_cpu,
            },
            instance_id: row.instance_id,
            public_ipv4,
            dns_name: row.dns_name,
            dns_record_id: row.dns_record_id,
            labels,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_list(statuses: &[NodeStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Capacity store backed by the `nodes` table.
#[derive(Clone)]
pub struct PgNodeStore {
    pool: PgPool,
}

impl PgNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_status(&self, id: NodeId) -> Result<Option<NodeStatus>, DbError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM nodes WHERE node_id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;

        status
            .map(|s| {
                s.parse().map_err(|e| DbError::Corrupt {
                    node_id: id.to_string(),
                    reason: format!("{e}"),
                })
            })
            .transpose()
    }

    /// Maps an update that matched no row onto the reason it did not match.
    async fn transition_failure(&self, id: NodeId, to: NodeStatus) -> DbError {
        match self.fetch_status(id).await {
            Ok(None) => DbError::NotFound(id),
            Ok(Some(from)) if !from.can_transition_to(to) => {
                DbError::InvalidTransition { id, from, to }
            }
            // Status allowed the move, so a capacity predicate failed.
            Ok(Some(_)) => DbError::InsufficientCapacity(id),
            Err(e) => e,
        }
    }

    async fn exists(&self, id: NodeId) -> Result<bool, DbError> {
        Ok(self.fetch_status(id).await?.is_some())
    }
}

#[async_trait]
impl CapacityStore for PgNodeStore {
    async fn best_fit(&self, demand: Demand) -> Result<Option<Node>, DbError> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM nodes
            WHERE status = 'well' AND free_mem >= $1 AND free_cpu >= $2
            ORDER BY free_mem DESC, free_cpu DESC, node_id ASC
            LIMIT 1
            "#
        ))
        .bind(demand.mem)
        .bind(demand.cpu)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(Node::try_from).transpose()
    }

    async fn atomic_decrement(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET free_mem = free_mem - $2,
                free_cpu = free_cpu - $3,
                updated_at = now()
            WHERE node_id = $1
              AND status = 'well'
              AND free_mem >= $2
              AND free_cpu >= $3
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(demand.mem)
        .bind(demand.cpu)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None if self.exists(id).await? => Err(DbError::InsufficientCapacity(id)),
            None => Err(DbError::NotFound(id)),
        }
    }

    async fn release(&self, id: NodeId, demand: Demand) -> Result<Node, DbError> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET free_mem = free_mem + $2,
                free_cpu = free_cpu + $3,
                updated_at = now()
            WHERE node_id = $1
              AND status = 'well'
              AND free_mem + $2 <= total_mem
              AND free_cpu + $3 <= total_cpu
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(demand.mem)
        .bind(demand.cpu)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None => match self.fetch_status(id).await? {
                None => Err(DbError::NotFound(id)),
                Some(NodeStatus::Well) => Err(DbError::CapacityOverflow(id)),
                Some(status) => Err(DbError::NotWell { id, status }),
            },
        }
    }

    async fn insert(&self, node: &Node) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                node_id, provider, name, server_type, location, workload_class,
                size_class, status, total_mem, total_cpu, free_mem, free_cpu,
                instance_id, public_ipv4, dns_name, dns_record_id, labels,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.provider.as_str())
        .bind(&node.name)
        .bind(&node.server_type)
        .bind(&node.location)
        .bind(&node.workload_class)
        .bind(&node.size_class)
        .bind(node.status.as_str())
        .bind(node.capacity.total_mem)
        .bind(node.capacity.total_cpu)
        .bind(node.capacity.free_mem)
        .bind(node.capacity.free_cpu)
        .bind(&node.instance_id)
        .bind(node.public_ipv4.map(|ip| ip.to_string()))
        .bind(&node.dns_name)
        .bind(&node.dns_record_id)
        .bind(Json(&node.labels))
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.code().as_deref() == Some("23505") {
                    return DbError::DuplicateIdentity(node.id.to_string());
                }
            }
            DbError::Query(e)
        })?;

        debug!(node_id = %node.id, name = %node.name, "Inserted node");
        Ok(())
    }

    async fn get(&self, id: NodeId) -> Result<Node, DbError> {
        let row: Option<NodeRow> =
            sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = $1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;

        row.map(Node::try_from)
            .transpose()?
            .ok_or(DbError::NotFound(id))
    }

    async fn list(&self, status: Option<NodeStatus>) -> Result<Vec<Node>, DbError> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM nodes
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at ASC, node_id ASC
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn mark_pending(
        &self,
        id: NodeId,
        instance_id: &str,
        public_ipv4: Ipv4Addr,
    ) -> Result<Node, DbError> {
        let to = NodeStatus::Pending;
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET status = $2,
                instance_id = $3,
                public_ipv4 = $4,
                updated_at = now()
            WHERE node_id = $1 AND status = ANY($5)
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(to.as_str())
        .bind(instance_id)
        .bind(public_ipv4.to_string())
        .bind(status_list(&NodeStatus::predecessors(to)))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None => Err(self.transition_failure(id, to).await),
        }
    }

    async fn record_dns(
        &self,
        id: NodeId,
        dns_name: &str,
        dns_record_id: Option<&str>,
    ) -> Result<Node, DbError> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET dns_name = $2,
                dns_record_id = $3,
                updated_at = now()
            WHERE node_id = $1 AND status = 'pending'
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(dns_name)
        .bind(dns_record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None => match self.fetch_status(id).await? {
                None => Err(DbError::NotFound(id)),
                Some(from) => Err(DbError::InvalidTransition {
                    id,
                    from,
                    to: NodeStatus::Pending,
                }),
            },
        }
    }

    async fn activate(&self, id: NodeId, activation: &Activation) -> Result<Node, DbError> {
        let to = NodeStatus::Well;
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET status = $2,
                dns_name = $3,
                dns_record_id = $4,
                free_mem = total_mem - $5,
                free_cpu = total_cpu - $6,
                updated_at = now()
            WHERE node_id = $1
              AND status = ANY($7)
              AND total_mem >= $5
              AND total_cpu >= $6
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(to.as_str())
        .bind(&activation.dns_name)
        .bind(&activation.dns_record_id)
        .bind(activation.demand.mem)
        .bind(activation.demand.cpu)
        .bind(status_list(&NodeStatus::predecessors(to)))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None => Err(self.transition_failure(id, to).await),
        }
    }

    async fn mark_stopped(&self, id: NodeId) -> Result<Node, DbError> {
        let to = NodeStatus::Stopped;
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET status = $2, updated_at = now()
            WHERE node_id = $1 AND status = ANY($3)
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(to.as_str())
        .bind(status_list(&NodeStatus::predecessors(to)))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Node::try_from(row),
            None => Err(self.transition_failure(id, to).await),
        }
    }

    async fn list_stuck(&self, older_than: DateTime<Utc>) -> Result<Vec<Node>, DbError> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS}
            FROM nodes
            WHERE status IN ('starting', 'pending') AND updated_at < $1
            ORDER BY updated_at ASC, node_id ASC
            "#
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}
