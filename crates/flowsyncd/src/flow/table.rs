//! The flow registry.

use super::FlowRecord;
use flow_types::FlowKey;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Counters for flow registry churn.
#[derive(Debug, Clone, Default)]
pub struct FlowTableStats {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub pairs_linked: u64,
}

/// Registry owning every [`FlowRecord`].
///
/// Keys are kept in order so the aging collector can resume its scan from a
/// persisted cursor without missing or double-visiting entries as flows
/// come and go between passes.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: BTreeMap<FlowKey, FlowRecord>,
    stats: FlowTableStats,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn stats(&self) -> &FlowTableStats {
        &self.stats
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.flows.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowRecord> {
        self.flows.get_mut(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Inserts a record, replacing any record already present for the key.
    ///
    /// Returns true if the key was new.
    pub fn insert(&mut self, record: FlowRecord) -> bool {
        let key = record.key;
        let fresh = self.flows.insert(key, record).is_none();
        if fresh {
            self.stats.added += 1;
        } else {
            self.stats.updated += 1;
        }
        fresh
    }

    /// Bonds two flows as a forward/reverse pair.
    ///
    /// Both records must already be present; missing records leave the
    /// other side untouched and return false.
    pub fn link_pair(&mut self, a: FlowKey, b: FlowKey) -> bool {
        if !self.flows.contains_key(&a) || !self.flows.contains_key(&b) {
            return false;
        }
        if let Some(rec) = self.flows.get_mut(&a) {
            rec.reverse_key = Some(b);
        }
        if let Some(rec) = self.flows.get_mut(&b) {
            rec.reverse_key = Some(a);
        }
        self.stats.pairs_linked += 1;
        true
    }

    /// Removes a record, unlinking its bonded partner if one remains.
    pub fn remove(&mut self, key: &FlowKey) -> Option<FlowRecord> {
        let record = self.flows.remove(key)?;
        if let Some(rev_key) = record.reverse_key {
            if let Some(rev) = self.flows.get_mut(&rev_key) {
                if rev.reverse_key == Some(*key) {
                    rev.reverse_key = None;
                }
            }
        }
        self.stats.removed += 1;
        Some(record)
    }

    /// Returns up to `limit` keys strictly after `cursor`, wrapping to the
    /// start of the table when the cursor is past the last key.
    ///
    /// `cursor = None` starts from the beginning.
    pub fn keys_after(&self, cursor: Option<&FlowKey>, limit: usize) -> Vec<FlowKey> {
        if self.flows.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut keys: Vec<FlowKey> = match cursor {
            Some(c) => self
                .flows
                .range((Bound::Excluded(*c), Bound::Unbounded))
                .take(limit)
                .map(|(k, _)| *k)
                .collect(),
            None => self.flows.keys().take(limit).copied().collect(),
        };
        if keys.is_empty() {
            // Cursor was at or past the last key; wrap around.
            keys = self.flows.keys().take(limit).copied().collect();
        }
        keys
    }

    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.flows.keys()
    }
}
