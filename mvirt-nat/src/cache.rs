//! In-memory record of the bindings whose rules are in the kernel.

use std::collections::{HashMap, HashSet};

use crate::model::Binding;

/// Bindings indexed by id and by the port they forward to.
///
/// Both indexes are kept consistent: every id listed under a port is present
/// in the primary index with that port, and empty port buckets are dropped.
#[derive(Debug, Default)]
pub struct BindingCache {
    by_id: HashMap<String, (Binding, Option<String>)>,
    by_port: HashMap<String, HashSet<String>>,
}

impl BindingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a binding, moving it to `port_id` if it changed.
    pub fn put(&mut self, binding: Binding, port_id: Option<&str>) {
        let id = binding.id.clone();
        if let Some((_, Some(old_port))) = self.by_id.get(&id) {
            let old_port = old_port.clone();
            self.unlink(&id, &old_port);
        }
        if let Some(port) = port_id {
            self.by_port
                .entry(port.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.by_id
            .insert(id, (binding, port_id.map(str::to_string)));
    }

    /// Remove a binding. `port_id` is only a hint; the recorded port wins.
    pub fn remove(&mut self, id: &str, port_id: Option<&str>) -> Option<Binding> {
        let (binding, recorded) = self.by_id.remove(id)?;
        if let Some(port) = recorded.as_deref().or(port_id) {
            self.unlink(id, port);
        }
        Some(binding)
    }

    fn unlink(&mut self, id: &str, port: &str) {
        if let Some(ids) = self.by_port.get_mut(port) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_port.remove(port);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Binding> {
        self.by_id.get(id).map(|(b, _)| b)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Bindings forwarding to `port_id`.
    pub fn get_by_port(&self, port_id: &str) -> Vec<&Binding> {
        self.by_port
            .get(port_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.by_id.values().map(|(b, _)| b)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_port.clear();
    }

    #[cfg(test)]
    fn port_buckets(&self) -> usize {
        self.by_port.len()
    }
}
