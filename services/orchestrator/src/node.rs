//! Node data model and lifecycle.
//!
//! A node is a provisioned compute instance tracked with capacity counters
//! and a status. Nodes are created in `Starting` when a provisioning attempt
//! reserves them, become `Pending` once the compute instance exists, and are
//! `Well` only after the instance, its DNS record, and the activated row all
//! exist. `Stopped` is terminal.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hoster_id::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::ServerType;

/// Maximum length of a workload or size class label.
pub const MAX_CLASS_LEN: usize = 32;

/// Maximum length of a provider instance name (hostname label limit).
pub const MAX_INSTANCE_NAME_LEN: usize = 63;

/// Validation failures for data entering the model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be a positive integer, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("{field} '{value}' is invalid: {reason}")]
    InvalidLabel {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown node status: {0}")]
    UnknownStatus(String),
}

// =============================================================================
// Provider and status
// =============================================================================

/// Compute provider a node was provisioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hetzner Cloud.
    Hcloud,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hcloud => "hcloud",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hcloud" => Ok(Self::Hcloud),
            other => Err(ValidationError::UnknownProvider(other.to_string())),
        }
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Row reserved; compute instance requested but not confirmed.
    Starting,
    /// Compute instance exists; DNS and activation outstanding.
    Pending,
    /// Fully provisioned and eligible for placements.
    Well,
    /// Deprovisioned or abandoned. Terminal.
    Stopped,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 4] = [Self::Starting, Self::Pending, Self::Well, Self::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Pending => "pending",
            Self::Well => "well",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true if the status should only be held for the duration of
    /// a provisioning workflow.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Starting | Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Starting, Pending) | (Pending, Well) | (Starting | Pending | Well, Stopped)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: NodeStatus) -> Vec<NodeStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "pending" => Ok(Self::Pending),
            "well" => Ok(Self::Well),
            "stopped" => Ok(Self::Stopped),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Capacity
// =============================================================================

/// Resource demand of a single workload: memory in MiB, CPU in vCPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub mem: i64,
    pub cpu: i32,
}

impl Demand {
    /// Both amounts must be strictly positive.
    pub fn new(mem: i64, cpu: i32) -> Result<Self, ValidationError> {
        if mem <= 0 {
            return Err(ValidationError::NonPositive {
                field: "requested_mem",
                value: mem,
            });
        }
        if cpu <= 0 {
            return Err(ValidationError::NonPositive {
                field: "requested_cpu",
                value: cpu.into(),
            });
        }
        Ok(Self { mem, cpu })
    }
}

/// Capacity counters of a node.
///
/// Totals are fixed at creation. The free counters always satisfy
/// `0 <= free <= total`; the checked operations below return `None` instead
/// of producing a value that would break that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub total_mem: i64,
    pub total_cpu: i32,
    pub free_mem: i64,
    pub free_cpu: i32,
}

impl Capacity {
    /// A fully free node.
    pub fn new(total_mem: i64, total_cpu: i32) -> Self {
        Self {
            total_mem,
            total_cpu,
            free_mem: total_mem,
            free_cpu: total_cpu,
        }
    }

    pub fn fits(&self, demand: Demand) -> bool {
        self.free_mem >= demand.mem && self.free_cpu >= demand.cpu
    }

    /// Capacity after hosting `demand`, if it fits.
    pub fn reserve(&self, demand: Demand) -> Option<Self> {
        if !self.fits(demand) {
            return None;
        }
        Some(Self {
            free_mem: self.free_mem - demand.mem,
            free_cpu: self.free_cpu - demand.cpu,
            ..*self
        })
    }

    /// Capacity after `demand` leaves, if that stays within the totals.
    pub fn release(&self, demand: Demand) -> Option<Self> {
        let free_mem = self.free_mem.checked_add(demand.mem)?;
        let free_cpu = self.free_cpu.checked_add(demand.cpu)?;
        if free_mem > self.total_mem || free_cpu > self.total_cpu {
            return None;
        }
        Some(Self {
            free_mem,
            free_cpu,
            ..*self
        })
    }

    /// `0 <= free <= total` for both dimensions.
    pub fn is_consistent(&self) -> bool {
        (0..=self.total_mem).contains(&self.free_mem) && (0..=self.total_cpu).contains(&self.free_cpu)
    }
}

// =============================================================================
// Placement request
// =============================================================================

/// A workload class or size class, e.g. `minecraft` or `small`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClassLabel(String);

impl ClassLabel {
    /// Normalises to lowercase and checks the hostname-safe charset.
    pub fn parse(field: &'static str, raw: &str) -> Result<Self, ValidationError> {
        let value = raw.trim().to_ascii_lowercase();
        let invalid = |reason| ValidationError::InvalidLabel {
            field,
            value: raw.to_string(),
            reason,
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > MAX_CLASS_LEN {
            return Err(invalid("must be at most 32 characters"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("may only contain letters, digits, and '-'"));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(invalid("must not start or end with '-'"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-facing placement request. Ephemeral, never persisted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlacementRequest {
    pub requested_mem: i64,
    pub requested_cpu: i32,
    pub workload_class: String,
    pub size_class: String,
}

/// A validated placement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub demand: Demand,
    pub workload_class: ClassLabel,
    pub size_class: ClassLabel,
}

impl TryFrom<PlacementRequest> for Workload {
    type Error = ValidationError;

    fn try_from(req: PlacementRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            demand: Demand::new(req.requested_mem, req.requested_cpu)?,
            workload_class: ClassLabel::parse("workload_class", &req.workload_class)?,
            size_class: ClassLabel::parse("size_class", &req.size_class)?,
        })
    }
}

// =============================================================================
// Node
// =============================================================================

/// A node record as held by the capacity store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub provider: Provider,
    /// Provider instance name, unique per provider.
    pub name: String,
    /// Provider size class the instance was created with.
    pub server_type: String,
    pub location: String,
    pub workload_class: String,
    pub size_class: String,
    pub status: NodeStatus,
    pub capacity: Capacity,
    /// Provider-assigned instance id; set once compute is ready.
    pub instance_id: Option<String>,
    pub public_ipv4: Option<Ipv4Addr>,
    /// Fully-qualified name; set once DNS registration succeeds.
    pub dns_name: Option<String>,
    pub dns_record_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Builds a fresh `Starting` node sized by `server_type` for `workload`.
    pub fn reserve(
        id: NodeId,
        provider: Provider,
        workload: &Workload,
        server_type: &ServerType,
        location: &str,
    ) -> Self {
        let now = Utc::now();
        let labels = BTreeMap::from([
            (
                "workload".to_string(),
                workload.workload_class.as_str().to_string(),
            ),
            ("size".to_string(), workload.size_class.as_str().to_string()),
        ]);

        Self {
            id,
            provider,
            name: instance_name(&workload.workload_class, &workload.size_class, id),
            server_type: server_type.name.clone(),
            location: location.to_string(),
            workload_class: workload.workload_class.as_str().to_string(),
            size_class: workload.size_class.as_str().to_string(),
            status: NodeStatus::Starting,
            capacity: Capacity::new(server_type.memory_mb, server_type.cores),
            instance_id: None,
            public_ipv4: None,
            dns_name: None,
            dns_record_id: None,
            labels,
            created_at: now,
            updated_at: now,
        }
    }
}

/// `<workload>-<size>-<node ulid>`, lowercase, trimmed to the hostname limit.
///
/// The ULID suffix is kept whole; class prefixes are shortened instead.
pub fn instance_name(workload_class: &ClassLabel, size_class: &ClassLabel, id: NodeId) -> String {
    let suffix = id.label();
    let prefix = format!("{}-{}", workload_class.as_str(), size_class.as_str());
    let room = MAX_INSTANCE_NAME_LEN - suffix.len() - 1;
    let prefix = prefix[..prefix.len().min(room)].trim_end_matches('-');
    format!("{prefix}-{suffix}")
}
