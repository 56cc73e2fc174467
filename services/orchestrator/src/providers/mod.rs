//! External provider seams.
//!
//! The orchestrator talks to two independently failing providers:
//!
//! - a **compute provisioner** that creates and deletes instances
//! - a **DNS registrar** that creates and deletes A records
//!
//! Both are trait objects so the workflow can be driven against real
//! provider bindings ([`hcloud`], [`cloudflare`]) or scripted fakes.
//!
//! Every provider failure is classified into exactly one of three outcome
//! classes. `Ambiguous` is distinct from failure: the call may have taken
//! effect, so the caller must compensate rather than retry.

mod catalog;
pub mod cloudflare;
pub mod hcloud;

pub use catalog::{ServerCatalog, ServerType};

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::node::Provider;

/// Classified provider failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network error, timeout before sending, 429, or 5xx. Nothing happened;
    /// safe to retry with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Validation error, quota exceeded, or other definitive refusal.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// The call may or may not have taken effect.
    #[error("provider outcome unknown: {0}")]
    Ambiguous(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Rejected(m) | Self::Ambiguous(m) => m,
        }
    }
}

/// Whether a call creates a resource. Determines how unclear outcomes
/// are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Delete,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Classify a transport-level failure.
///
/// A create whose request may have reached the provider is ambiguous;
/// a delete is idempotent and can simply be retried.
pub(crate) fn classify_send_error(err: &reqwest::Error, kind: CallKind) -> ProviderError {
    if err.is_connect() {
        return ProviderError::Transient(format!("connection failed: {err}"));
    }
    match kind {
        CallKind::Create => ProviderError::Ambiguous(format!("request outcome unknown: {err}")),
        CallKind::Delete => ProviderError::Transient(format!("request failed: {err}")),
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{status}: {}", truncate(body, 512));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Rejected(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// Compute
// =============================================================================

/// Parameters for a new compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    /// Provider size class, e.g. `cax11`.
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
}

/// A created compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeInstance {
    pub instance_id: String,
    pub name: String,
    pub public_ipv4: Ipv4Addr,
}

/// Creates and destroys compute instances.
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    /// The provider this provisioner talks to.
    fn provider(&self) -> Provider;

    /// Create an instance and return its identity and public address.
    async fn create(&self, spec: &InstanceSpec) -> Result<ComputeInstance, ProviderError>;

    /// Delete an instance. Deleting an instance that no longer exists succeeds.
    async fn delete(&self, instance_id: &str) -> Result<(), ProviderError>;

    /// Delete an instance by name, for when a create had an unknown outcome.
    ///
    /// Returns `false` if no instance with that name exists.
    async fn delete_by_name(&self, name: &str) -> Result<bool, ProviderError>;
}

// =============================================================================
// DNS
// =============================================================================

/// Parameters for a new A record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordSpec {
    pub zone: String,
    pub name: String,
    pub address: Ipv4Addr,
    pub ttl: u32,
}

/// Creates and deletes DNS records.
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    /// Create an A record and return the provider's record id.
    async fn create_record(&self, record: &DnsRecordSpec) -> Result<String, ProviderError>;

    /// Delete a record. Deleting a record that no longer exists succeeds.
    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), ProviderError>;

    /// Delete all A records with `name`, for when a create had an unknown
    /// outcome. Returns `false` if there were none.
    async fn delete_record_by_name(&self, zone: &str, name: &str) -> Result<bool, ProviderError>;
}
