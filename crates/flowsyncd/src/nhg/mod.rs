//! Multipath (ECMP) group composition.

mod composer;
mod types;

pub use composer::{NhgComposer, NhgError, NhgStats};
pub use types::{
    tunnel, DeliveryTarget, GroupMember, LoadBalanceFields, NexthopGroup, PathAttributes,
    PeerClass, Route, RoutePath,
};
