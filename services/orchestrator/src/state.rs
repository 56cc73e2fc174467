//! Application state shared across request handlers.

use std::sync::Arc;

use crate::orchestrator::Orchestrator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { orchestrator }),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }
}
