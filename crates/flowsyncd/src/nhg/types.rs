//! Route, path and multipath group types.

use flow_types::Label;

/// Origin class of a route path.
///
/// Only co-resident workload paths are composited into multipath groups;
/// control-plane paths keep their own forwarding structures and everything
/// else is ignored by the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    /// Path to a workload co-resident on this router.
    LocalWorkload,
    /// Path learned from the control plane.
    ControlPlane,
    /// Synthetic and bookkeeping peers.
    Other,
}

/// Fields feeding the multipath load-balance hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalanceFields {
    pub l3_source_address: bool,
    pub l3_destination_address: bool,
    pub l4_protocol: bool,
    pub l4_source_port: bool,
    pub l4_destination_port: bool,
}

impl Default for LoadBalanceFields {
    fn default() -> Self {
        Self {
            l3_source_address: true,
            l3_destination_address: true,
            l4_protocol: true,
            l4_source_port: true,
            l4_destination_port: true,
        }
    }
}

/// Tunnel encapsulations a path supports, as a bitmap.
pub mod tunnel {
    pub const GRE: u32 = 1 << 0;
    pub const UDP: u32 = 1 << 1;
    pub const VXLAN: u32 = 1 << 2;
    pub const NATIVE: u32 = 1 << 3;
}

/// Cross-cutting path attributes propagated onto the group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathAttributes {
    pub tunnel_types: u32,
    pub tags: Vec<u32>,
    pub communities: Vec<String>,
    pub preference: u32,
    pub load_balance: LoadBalanceFields,
}

/// One contributing path of a route.
#[derive(Debug, Clone)]
pub struct RoutePath {
    /// Identity of the peer that contributed the path.
    pub peer: String,
    pub peer_class: PeerClass,
    /// Key of the underlying nexthop.
    pub nexthop: String,
    pub label: Label,
    /// Whether the path's preference makes it a multipath contributor.
    pub ecmp_eligible: bool,
    pub attrs: PathAttributes,
}

/// One component of a multipath group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub nexthop: String,
    pub label: Label,
}

/// A composite nexthop representing a set of equal-cost paths.
///
/// Member slots are positional: flows pin their component index, so
/// removing a member leaves a hole instead of shifting its neighbors, and
/// appending fills the first hole.
#[derive(Debug, Clone)]
pub struct NexthopGroup {
    pub label: Label,
    members: Vec<Option<GroupMember>>,
    pub attrs: PathAttributes,
}

impl NexthopGroup {
    pub fn new(label: Label, first: GroupMember, second: GroupMember, attrs: PathAttributes) -> Self {
        Self {
            label,
            members: vec![Some(first), Some(second)],
            attrs,
        }
    }

    /// Active (non-hole) component count.
    pub fn component_count(&self) -> usize {
        self.members.iter().flatten().count()
    }

    pub fn members(&self) -> impl Iterator<Item = (usize, &GroupMember)> {
        self.members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m)))
    }

    pub fn slot_of(&self, nexthop: &str) -> Option<usize> {
        self.members()
            .find(|(_, m)| m.nexthop == nexthop)
            .map(|(i, _)| i)
    }

    pub fn member_mut(&mut self, nexthop: &str) -> Option<&mut GroupMember> {
        self.members
            .iter_mut()
            .flatten()
            .find(|m| m.nexthop == nexthop)
    }

    /// Appends a member into the first free slot, returning the slot.
    pub fn append(&mut self, member: GroupMember) -> usize {
        if let Some(slot) = self.members.iter().position(Option::is_none) {
            self.members[slot] = Some(member);
            slot
        } else {
            self.members.push(Some(member));
            self.members.len() - 1
        }
    }

    /// Clears the slot holding `nexthop`, leaving a hole.
    pub fn take(&mut self, nexthop: &str) -> Option<GroupMember> {
        let slot = self.slot_of(nexthop)?;
        self.members[slot].take()
    }

    /// The sole remaining member, if exactly one is left.
    pub fn sole_member(&self) -> Option<&GroupMember> {
        let mut it = self.members.iter().flatten();
        let first = it.next()?;
        if it.next().is_some() {
            None
        } else {
            Some(first)
        }
    }
}

/// What a locally-delivered packet should be handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The route's own multipath group.
    Group(Label),
    /// A retained local-delivery label (route leaked across domains).
    Label(Label),
    /// A single underlying nexthop.
    Nexthop(String),
}

/// A route and its contributing paths.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub prefix: String,
    pub paths: Vec<RoutePath>,
    /// The synthetic multipath path, present only while ≥ 2 eligible
    /// local paths contribute.
    pub group: Option<NexthopGroup>,
    /// Local-delivery label cached when the route was leaked here.
    pub local_delivery_label: Option<Label>,
    /// Composite inherited from another routing domain, when the active
    /// nexthop is not our own group.
    pub imported_group: Option<NexthopGroup>,
}

impl Route {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn find_path(&self, peer: &str) -> Option<&RoutePath> {
        self.paths.iter().find(|p| p.peer == peer)
    }

    /// Eligible contributing paths of a class.
    pub fn contributing_paths(&self, class: PeerClass) -> impl Iterator<Item = &RoutePath> {
        self.paths
            .iter()
            .filter(move |p| p.peer_class == class && p.ecmp_eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(nexthop: &str, label: u32) -> GroupMember {
        GroupMember {
            nexthop: nexthop.to_string(),
            label: Label::new(label),
        }
    }

    #[test]
    fn test_slots_are_positional() {
        let mut group = NexthopGroup::new(
            Label::new(100),
            member("vm-1", 11),
            member("vm-2", 12),
            PathAttributes::default(),
        );
        let slot = group.append(member("vm-3", 13));
        assert_eq!(slot, 2);
        assert_eq!(group.component_count(), 3);

        // Removing the middle member leaves a hole; vm-3 keeps slot 2.
        group.take("vm-2").unwrap();
        assert_eq!(group.component_count(), 2);
        assert_eq!(group.slot_of("vm-3"), Some(2));

        // The next append reuses the hole.
        assert_eq!(group.append(member("vm-4", 14)), 1);
    }

    #[test]
    fn test_sole_member() {
        let mut group = NexthopGroup::new(
            Label::new(100),
            member("vm-1", 11),
            member("vm-2", 12),
            PathAttributes::default(),
        );
        assert!(group.sole_member().is_none());
        group.take("vm-1").unwrap();
        assert_eq!(group.sole_member().unwrap().nexthop, "vm-2");
    }

    #[test]
    fn test_contributing_paths_filter() {
        let mut route = Route::new("10.1.0.0/24");
        route.paths.push(RoutePath {
            peer: "vm-1".into(),
            peer_class: PeerClass::LocalWorkload,
            nexthop: "nh-1".into(),
            label: Label::new(1),
            ecmp_eligible: true,
            attrs: PathAttributes::default(),
        });
        route.paths.push(RoutePath {
            peer: "bgp-1".into(),
            peer_class: PeerClass::ControlPlane,
            nexthop: "nh-2".into(),
            label: Label::new(2),
            ecmp_eligible: true,
            attrs: PathAttributes::default(),
        });
        route.paths.push(RoutePath {
            peer: "vm-2".into(),
            peer_class: PeerClass::LocalWorkload,
            nexthop: "nh-3".into(),
            label: Label::new(3),
            ecmp_eligible: false,
            attrs: PathAttributes::default(),
        });

        let local: Vec<_> = route.contributing_paths(PeerClass::LocalWorkload).collect();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].peer, "vm-1");
    }
}
