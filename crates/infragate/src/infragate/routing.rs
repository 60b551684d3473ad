use std::sync::Arc;

use dashmap::DashMap;

use crate::infragate::{backend::Backend, router::RoutingKey};

/// A routing key that moved from one backend to another on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: RoutingKey,
    pub previous: String,
    pub next: String,
}

/// Concurrent map of routing key to backend.
///
/// Reads are lock-free per shard. Writers are serialized by the gateway, so a
/// backend's keys are never observed half-replaced by another writer.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: DashMap<RoutingKey, Arc<Backend>>,
    backends: DashMap<String, Arc<Backend>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every key of `backend`; last writer wins.
    pub fn insert(&self, backend: Arc<Backend>) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for key in backend.routing_keys() {
            if let Some(prev) = self.routes.insert(key.clone(), backend.clone())
                && prev.id != backend.id
            {
                conflicts.push(Conflict {
                    key,
                    previous: prev.id.clone(),
                    next: backend.id.clone(),
                });
            }
        }
        self.backends.insert(backend.id.clone(), backend);
        conflicts
    }

    /// Drop `id` and every key still pointing at it. Keys since taken over by
    /// another backend are left alone.
    pub fn remove(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = self.backends.remove(id).map(|(_, b)| b)?;
        self.routes.retain(|_, b| b.id != id);
        Some(removed)
    }

    pub fn lookup(&self, key: &RoutingKey) -> Option<Arc<Backend>> {
        self.routes.get(key).map(|b| b.value().clone())
    }

    pub fn uses_listen_addr(&self, listen_addr: &str) -> bool {
        self.backends.iter().any(|b| b.listen_addr == listen_addr)
    }

    /// Registered backends with the keys currently routed to each, sorted by id.
    pub fn snapshot(&self) -> Vec<(Arc<Backend>, Vec<RoutingKey>)> {
        let mut out: Vec<(Arc<Backend>, Vec<RoutingKey>)> = self
            .backends
            .iter()
            .map(|b| {
                let mut keys: Vec<RoutingKey> = self
                    .routes
                    .iter()
                    .filter(|r| r.value().id == b.id)
                    .map(|r| r.key().clone())
                    .collect();
                keys.sort();
                (b.value().clone(), keys)
            })
            .collect();
        out.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        out
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
