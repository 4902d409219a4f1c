//! Shadow registries for objects the sync layer depends on.
//!
//! Nexthops and mirror destinations are owned elsewhere in the agent; the
//! sync layer only needs to know whether the kernel-visible counterpart of
//! a given object exists yet, and which index it got. These registries hold
//! exactly that: a name, an optional kernel index, and a reference count
//! from the flows depending on the object.
//!
//! Resolution events (an object obtained or lost its kernel index) arrive
//! from the owning subsystem through [`ShadowRegistry::resolve`] /
//! [`ShadowRegistry::unresolve`].

use flow_sync_common::{HasRefCount, RefMap};
use tracing::debug;

/// Shadow of one external object.
#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub name: String,
    pub index: Option<u32>,
    ref_count: u32,
}

impl ShadowEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            index: None,
            ref_count: 0,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.index.is_some()
    }
}

impl HasRefCount for ShadowEntry {
    fn increment_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        if self.ref_count == 0 {
            None
        } else {
            self.ref_count -= 1;
            Some(self.ref_count)
        }
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Registry of shadow objects of one kind (nexthops, mirror destinations).
#[derive(Debug, Default)]
pub struct ShadowRegistry {
    kind: &'static str,
    entries: RefMap<String, ShadowEntry>,
}

impl ShadowRegistry {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RefMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes a reference on the shadow for `name`, creating it unresolved
    /// if this is the first reference.
    pub fn get_or_create_ref(&mut self, name: &str) -> u32 {
        let entry = self
            .entries
            .get_or_insert_with(name.to_string(), || ShadowEntry::new(name.to_string()));
        entry.increment_ref()
    }

    /// Drops one reference; the shadow is removed once unreferenced and
    /// unresolved (a resolved shadow is kept so its index survives a brief
    /// zero-reference window).
    pub fn drop_ref(&mut self, name: &str) {
        let key = name.to_string();
        match self.entries.decrement_ref(&key) {
            Ok(0) => {
                if self.entries.get(&key).is_some_and(|e| !e.is_resolved()) {
                    self.entries.remove(&key);
                }
            }
            Ok(_) => {}
            Err(err) => {
                debug!(kind = self.kind, name, %err, "dropping unknown shadow reference");
            }
        }
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.entries
            .get(&name.to_string())
            .is_some_and(ShadowEntry::is_resolved)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.entries.get(&name.to_string()).and_then(|e| e.index)
    }

    pub fn ref_count(&self, name: &str) -> Option<u32> {
        self.entries.ref_count(&name.to_string())
    }

    /// Marks the shadow resolved with its kernel index, creating it if no
    /// flow has referenced it yet.
    pub fn resolve(&mut self, name: &str, index: u32) {
        let entry = self
            .entries
            .get_or_insert_with(name.to_string(), || ShadowEntry::new(name.to_string()));
        entry.index = Some(index);
        debug!(kind = self.kind, name, index, "shadow resolved");
    }

    /// Clears the shadow's kernel index; dependants go back to waiting.
    pub fn unresolve(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(&name.to_string()) {
            entry.index = None;
            debug!(kind = self.kind, name, "shadow unresolved");
        }
    }
}
