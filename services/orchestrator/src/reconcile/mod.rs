//! Reconciliation of nodes stuck in a transient status.
//!
//! A crash between reserving a node and activating it leaves a `Starting`
//! or `Pending` row and possibly a live instance. The sweep finds such rows
//! once they are older than the stale threshold, deletes whatever external
//! resources they recorded, and marks them `Stopped`.

mod sweeper;
mod worker;

pub use sweeper::{StuckNodeSweeper, SweepStats};
pub use worker::SweepWorker;
