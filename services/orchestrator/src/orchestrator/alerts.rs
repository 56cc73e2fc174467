//! Orphan resource alerting.
//!
//! A compensating delete that fails leaves a live, billed resource nobody
//! tracks. Each such resource is reported exactly once to an
//! [`OrphanAlertSink`] with enough detail to clean it up by hand.

use hoster_id::NodeId;
use serde::Serialize;
use tracing::error;

use super::Stage;

/// An external resource left live after a failed compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrphanResource {
    Instance {
        /// Absent when the create outcome was ambiguous.
        instance_id: Option<String>,
        name: String,
    },
    DnsRecord {
        zone: String,
        record_id: Option<String>,
        name: String,
    },
}

/// Alert raised for one orphaned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanAlert {
    pub node_id: NodeId,
    pub stage: Stage,
    pub resource: OrphanResource,
    /// Why the compensating delete failed.
    pub reason: String,
}

/// Receives orphan alerts.
pub trait OrphanAlertSink: Send + Sync {
    fn raise(&self, alert: &OrphanAlert);
}

/// Reports orphans as `error` level log events tagged
/// `alert = "orphan_resource"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl OrphanAlertSink for LogAlertSink {
    fn raise(&self, alert: &OrphanAlert) {
        match &alert.resource {
            OrphanResource::Instance { instance_id, name } => error!(
                alert = "orphan_resource",
                node_id = %alert.node_id,
                stage = %alert.stage,
                resource = "instance",
                instance_id = instance_id.as_deref().unwrap_or("unknown"),
                name = %name,
                reason = %alert.reason,
                "Compute instance orphaned; manual cleanup required"
            ),
            OrphanResource::DnsRecord {
                zone,
                record_id,
                name,
            } => error!(
                alert = "orphan_resource",
                node_id = %alert.node_id,
                stage = %alert.stage,
                resource = "dns_record",
                zone = %zone,
                record_id = record_id.as_deref().unwrap_or("unknown"),
                name = %name,
                reason = %alert.reason,
                "DNS record orphaned; manual cleanup required"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_serializes_tagged() {
        let resource = OrphanResource::Instance {
            instance_id: Some("4711".into()),
            name: "game-small-x".into(),
        };
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["kind"], "instance");
        assert_eq!(json["instance_id"], "4711");
    }

    #[test]
    fn test_log_sink_accepts_alerts() {
        LogAlertSink.raise(&OrphanAlert {
            node_id: NodeId::new(),
            stage: Stage::Dns,
            resource: OrphanResource::DnsRecord {
                zone: "z".into(),
                record_id: None,
                name: "a.game.example.net".into(),
            },
            reason: "503".into(),
        });
    }
}
