//! # hoster-id
//!
//! Typed identifiers for the node orchestrator.
//!
//! Every identifier is a ULID behind a resource prefix: `{prefix}_{ulid}`.
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! A node's identity is generated once, when its provisioning attempt starts,
//! and never changes. Because the ULID carries 80 random bits, a fresh
//! identity also makes the derived instance name collision-resistant.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
