//! Process-wide registry of cached resources.
//!
//! Every [crate::cache::CachedData] registers itself on construction and leaves the
//! registry when dropped. The registry only holds weak references, so registration
//! never extends a resource's lifetime. It is meant for diagnostics: listing resources,
//! searching them by name and forcing them outdated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::cache::Outdatable;

/// Introspection surface of a registered resource.
pub trait RegisteredResource: Outdatable {
    fn is_loaded(&self) -> bool;
    fn is_loading(&self) -> bool;
    fn is_outdated(&self) -> bool;
}

/// Snapshot of a registered resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: u64,
    pub name: String,
    pub type_name: String,
    pub loaded: bool,
    pub loading: bool,
    pub outdated: bool,
}

struct Entry {
    name: String,
    type_name: &'static str,
    resource: Weak<dyn RegisteredResource>,
}

pub struct ResourceRegistry {
    entries: RwLock<BTreeMap<u64, Entry>>,
    next_id: AtomicU64,
}

static GLOBAL_REGISTRY: OnceLock<ResourceRegistry> = OnceLock::new();

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        ResourceRegistry {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registry used by all cached resources of the process.
    pub fn global() -> &'static ResourceRegistry {
        GLOBAL_REGISTRY.get_or_init(ResourceRegistry::new)
    }

    pub fn register(
        &self,
        name: &str,
        type_name: &'static str,
        resource: Weak<dyn RegisteredResource>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(id, name, "Registering resource");
        self.entries.write().insert(
            id,
            Entry {
                name: name.to_owned(),
                type_name,
                resource,
            },
        );
        id
    }

    pub fn unregister(&self, id: u64) {
        if let Some(entry) = self.entries.write().remove(&id) {
            debug!(id, name = %entry.name, "Unregistered resource");
        }
    }

    fn live(&self) -> Vec<(u64, String, &'static str, Arc<dyn RegisteredResource>)> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .resource
                    .upgrade()
                    .map(|resource| (*id, entry.name.clone(), entry.type_name, resource))
            })
            .collect()
    }

    /// All live resources, ordered by name.
    pub fn resources(&self) -> Vec<ResourceInfo> {
        let mut resources: Vec<ResourceInfo> = self
            .live()
            .into_iter()
            .map(|(id, name, type_name, resource)| ResourceInfo {
                id,
                name,
                type_name: type_name.to_owned(),
                loaded: resource.is_loaded(),
                loading: resource.is_loading(),
                outdated: resource.is_outdated(),
            })
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        resources
    }

    /// Resources whose name contains `text`, case-insensitive.
    pub fn search(&self, text: &str) -> Vec<ResourceInfo> {
        let text = text.to_lowercase();
        self.resources()
            .into_iter()
            .filter(|info| info.name.to_lowercase().contains(&text))
            .collect()
    }

    /// Live resources registered under exactly `name`.
    pub fn find(&self, name: &str) -> Vec<Arc<dyn RegisteredResource>> {
        self.live()
            .into_iter()
            .filter(|(_, n, _, _)| n == name)
            .map(|(_, _, _, resource)| resource)
            .collect()
    }

    /// Mark every resource named `name` outdated. Returns how many were affected.
    pub fn mark_outdated(&self, name: &str) -> usize {
        let found = self.find(name);
        for resource in found.iter() {
            resource.mark_outdated();
        }
        found.len()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
