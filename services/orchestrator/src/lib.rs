//! Node allocation and provisioning orchestrator.
//!
//! This crate primarily ships an `orchestrator` binary, but exposes its
//! library surface for integration testing and reuse.

pub mod api;
pub mod config;
pub mod db;
pub mod node;
pub mod orchestrator;
pub mod providers;
pub mod reconcile;
pub mod state;
