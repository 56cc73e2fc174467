//! Identifier types used by the orchestrator.

use crate::typed_id;

typed_id!(
    /// Identity of a provisioned node. Generated at the start of a
    /// provisioning attempt and immutable afterwards.
    NodeId,
    "node"
);

typed_id!(
    /// Correlates the log lines of a single placement request.
    RequestId,
    "req"
);
