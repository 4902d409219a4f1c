//! The multipath composer.
//!
//! Maintains the invariant that exactly the set of currently-contributing,
//! ECMP-eligible local paths of a route is represented as one multipath
//! group with a stable label: crossing from one to two contributors
//! creates the group, crossing back destroys it and frees the label, and
//! membership churn in between never rebuilds the group or disturbs the
//! other members.

use super::types::{
    DeliveryTarget, GroupMember, NexthopGroup, PathAttributes, PeerClass, Route, RoutePath,
};
use flow_types::Label;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum NhgError {
    /// Delete of a component that is not in the group: a caller bug,
    /// logged and dropped rather than taking the process down.
    #[error("component {nexthop} not found in group of {route}")]
    MemberNotFound { route: String, nexthop: String },

    #[error("forwarding label space exhausted")]
    LabelExhausted,
}

#[derive(Debug, Clone, Default)]
pub struct NhgStats {
    pub groups_created: u64,
    pub groups_destroyed: u64,
    pub members_appended: u64,
    pub members_removed: u64,
    pub members_updated: u64,
    pub params_synced: u64,
    pub member_not_found_errors: u64,
}

/// Allocates group labels.
#[derive(Debug)]
struct LabelAllocator {
    next: u32,
    free: Vec<u32>,
}

impl LabelAllocator {
    /// Group labels start above the per-path label range.
    const BASE: u32 = 1 << 16;

    fn new() -> Self {
        Self {
            next: Self::BASE,
            free: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<Label> {
        if let Some(value) = self.free.pop() {
            return Some(Label::new(value));
        }
        if self.next > Label::MAX {
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(Label::new(value))
    }

    fn release(&mut self, label: Label) {
        if label.is_valid() {
            self.free.push(label.value());
        }
    }
}

/// Builds, mutates and destroys multipath groups in response to path
/// add/delete events on a route.
pub struct NhgComposer {
    labels: LabelAllocator,
    stats: NhgStats,
}

impl Default for NhgComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl NhgComposer {
    pub fn new() -> Self {
        Self {
            labels: LabelAllocator::new(),
            stats: NhgStats::default(),
        }
    }

    pub fn stats(&self) -> &NhgStats {
        &self.stats
    }

    /// Handles a path add or update on `route`.
    ///
    /// Returns whether the route's forwarding structure changed (and thus
    /// needs re-encoding downstream).
    pub fn path_add(&mut self, route: &mut Route, path: RoutePath) -> Result<bool, NhgError> {
        let class = path.peer_class;
        let eligible = path.ecmp_eligible;

        // Upsert the path itself.
        match route.paths.iter_mut().find(|p| p.peer == path.peer) {
            Some(existing) => *existing = path.clone(),
            None => route.paths.push(path.clone()),
        }

        if class != PeerClass::LocalWorkload || !eligible {
            return Ok(false);
        }

        let count = route.contributing_paths(PeerClass::LocalWorkload).count();
        if count <= 1 {
            // Not yet eligible for composition.
            return Ok(false);
        }

        if let Some(group) = route.group.as_mut() {
            if group.slot_of(&path.nexthop).is_some() {
                // Re-add of an existing member: its own label may have
                // moved (policy flip on the underlying nexthop). Update
                // that one component in place; never rebuild the group.
                let mut changed = false;
                let member = group.member_mut(&path.nexthop).expect("slot exists");
                if member.label != path.label {
                    member.label = path.label;
                    self.stats.members_updated += 1;
                    changed = true;
                }
                if Self::sync_params_inner(group, &path.attrs) {
                    self.stats.params_synced += 1;
                    changed = true;
                }
                return Ok(changed);
            }

            let slot = group.append(GroupMember {
                nexthop: path.nexthop.clone(),
                label: path.label,
            });
            self.stats.members_appended += 1;
            if Self::sync_params_inner(group, &path.attrs) {
                self.stats.params_synced += 1;
            }
            debug!(route = %route.prefix, nexthop = %path.nexthop, slot, "multipath member appended");
            return Ok(true);
        }

        if count > 2 {
            // More than two contributors without a group: the 1→2
            // transition was missed somewhere upstream. Recover by
            // composing from scratch instead of asserting.
            warn!(route = %route.prefix, count, "composing group late for route");
        }

        let members: Vec<GroupMember> = route
            .contributing_paths(PeerClass::LocalWorkload)
            .filter(|p| p.peer != path.peer)
            .map(|p| GroupMember {
                nexthop: p.nexthop.clone(),
                label: p.label,
            })
            .chain(std::iter::once(GroupMember {
                nexthop: path.nexthop.clone(),
                label: path.label,
            }))
            .collect();

        let label = self.labels.allocate().ok_or(NhgError::LabelExhausted)?;
        let mut iter = members.into_iter();
        let first = iter.next().expect("two contributors");
        let second = iter.next().expect("two contributors");
        let mut group = NexthopGroup::new(label, first, second, path.attrs.clone());
        for extra in iter {
            group.append(extra);
        }
        debug!(route = %route.prefix, label = %label, "multipath group created");
        route.group = Some(group);
        self.stats.groups_created += 1;
        Ok(true)
    }

    /// Handles deletion of the path contributed by `peer`.
    pub fn path_delete(&mut self, route: &mut Route, peer: &str) -> Result<bool, NhgError> {
        let Some(pos) = route.paths.iter().position(|p| p.peer == peer) else {
            return Ok(false);
        };
        let path = route.paths.remove(pos);
        if path.peer_class != PeerClass::LocalWorkload || !path.ecmp_eligible {
            return Ok(false);
        }

        let remaining = route.contributing_paths(PeerClass::LocalWorkload).count();
        let Some(group) = route.group.as_mut() else {
            return Ok(false);
        };

        if remaining <= 1 {
            // 2 → 1: the group dies with its label and the route falls
            // back to the sole remaining path directly.
            let label = group.label;
            route.group = None;
            self.labels.release(label);
            self.stats.groups_destroyed += 1;
            debug!(route = %route.prefix, label = %label, "multipath group destroyed");
            return Ok(true);
        }

        if group.take(&path.nexthop).is_none() {
            self.stats.member_not_found_errors += 1;
            warn!(route = %route.prefix, nexthop = %path.nexthop,
                  "delete of absent multipath component dropped");
            return Err(NhgError::MemberNotFound {
                route: route.prefix.clone(),
                nexthop: path.nexthop,
            });
        }
        self.stats.members_removed += 1;
        Ok(true)
    }

    /// Propagates cross-cutting attributes onto the group, independent of
    /// membership churn. Returns whether anything changed, so callers can
    /// skip a spurious downstream re-encode.
    pub fn sync_params(&mut self, group: &mut NexthopGroup, attrs: &PathAttributes) -> bool {
        let changed = Self::sync_params_inner(group, attrs);
        if changed {
            self.stats.params_synced += 1;
        }
        changed
    }

    fn sync_params_inner(group: &mut NexthopGroup, attrs: &PathAttributes) -> bool {
        let mut changed = false;
        if group.attrs.tunnel_types != attrs.tunnel_types {
            group.attrs.tunnel_types = attrs.tunnel_types;
            changed = true;
        }
        if group.attrs.tags != attrs.tags {
            group.attrs.tags = attrs.tags.clone();
            changed = true;
        }
        if group.attrs.communities != attrs.communities {
            group.attrs.communities = attrs.communities.clone();
            changed = true;
        }
        if group.attrs.preference != attrs.preference {
            group.attrs.preference = attrs.preference;
            changed = true;
        }
        if group.attrs.load_balance != attrs.load_balance {
            group.attrs.load_balance = attrs.load_balance;
            changed = true;
        }
        changed
    }

    /// Resolves where locally-delivered traffic for `route` goes.
    ///
    /// Order matters when routes are leaked across domains: the route's
    /// own group wins, then a retained local-delivery label, then the
    /// first local path, and only then a composite inherited from another
    /// domain.
    pub fn local_delivery_nexthop(route: &Route) -> Option<DeliveryTarget> {
        if let Some(group) = &route.group {
            return Some(DeliveryTarget::Group(group.label));
        }
        if let Some(label) = route.local_delivery_label {
            return Some(DeliveryTarget::Label(label));
        }
        if let Some(path) = route
            .paths
            .iter()
            .find(|p| p.peer_class == PeerClass::LocalWorkload)
        {
            return Some(DeliveryTarget::Nexthop(path.nexthop.clone()));
        }
        if let Some(imported) = &route.imported_group {
            if let Some((_, member)) = imported.members().next() {
                return Some(DeliveryTarget::Nexthop(member.nexthop.clone()));
            }
        }
        None
    }
}
