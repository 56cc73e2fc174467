//! Provider size classes and the mapping from a resource demand onto one.

use serde::Serialize;

use crate::node::Demand;

/// A provider instance size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerType {
    pub name: String,
    pub cores: i32,
    pub memory_mb: i64,
}

impl ServerType {
    pub fn new(name: impl Into<String>, cores: i32, memory_mb: i64) -> Self {
        Self {
            name: name.into(),
            cores,
            memory_mb,
        }
    }

    pub fn fits(&self, demand: Demand) -> bool {
        self.memory_mb >= demand.mem && self.cores >= demand.cpu
    }
}

/// Orderable set of size classes.
///
/// Entries are kept sorted by memory, then cores, then name, so the first
/// fitting entry is the smallest instance able to host a demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCatalog {
    types: Vec<ServerType>,
}

impl ServerCatalog {
    pub fn new(mut types: Vec<ServerType>) -> Self {
        types.retain(|t| t.cores > 0 && t.memory_mb > 0);
        types.sort_by(|a, b| {
            a.memory_mb
                .cmp(&b.memory_mb)
                .then(a.cores.cmp(&b.cores))
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { types }
    }

    /// Hetzner's shared ARM line, used when the live catalog cannot be loaded.
    pub fn builtin() -> Self {
        Self::new(vec![
            ServerType::new("cax11", 2, 4 * 1024),
            ServerType::new("cax21", 4, 8 * 1024),
            ServerType::new("cax31", 8, 16 * 1024),
            ServerType::new("cax41", 16, 32 * 1024),
        ])
    }

    /// Smallest size class able to host `demand`.
    pub fn select(&self, demand: Demand) -> Option<&ServerType> {
        self.types.iter().find(|t| t.fits(demand))
    }

    pub fn types(&self) -> &[ServerType] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
