//! Shared value types for the localization protocol.
//!
//! Contains:
//! - `NodeAddress`: the opaque 4-byte identity a node is known by
//! - `Position`: a 2-D coordinate pair in world units (meters)
//! - `Interface`: one network attachment point (local address + netmask)
//! - `NodeRole`: beacon / unknown tagged union

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Network identity of a node.
///
/// Used both as the node's own address and as the key under which beacons
/// are tracked by everybody else. Ordered by numeric value so that distance
/// table snapshots and tie-breaks are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(Ipv4Addr);

impl NodeAddress {
    pub const fn new(addr: Ipv4Addr) -> Self {
        Self(addr)
    }

    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Self(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    }

    pub const fn ip(&self) -> Ipv4Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    /// Whether the address can identify a single node on the wire.
    ///
    /// Unspecified, multicast, loopback and reserved class E addresses
    /// (240.0.0.0/4, limited broadcast included) never name a node, so a
    /// packet carrying one as beacon address is malformed.
    pub fn is_node_identity(&self) -> bool {
        let ip = self.0;
        !(ip.is_unspecified() || ip.is_multicast() || ip.is_loopback() || ip.octets()[0] >= 240)
    }
}

impl From<Ipv4Addr> for NodeAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 2-D point in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One network attachment point of a node.
///
/// Mirrors an IPv4 interface address: the local address plus the prefix
/// length of its subnet. The broadcast address used for flooding is derived
/// from these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interface {
    pub local: NodeAddress,
    pub prefix_len: u8,
}

impl Interface {
    pub fn new(local: NodeAddress, prefix_len: u8) -> Self {
        Self {
            local,
            prefix_len: prefix_len.min(32),
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = if self.prefix_len == 0 { 0 } else { u32::MAX << (32 - self.prefix_len as u32) };
        Ipv4Addr::from(bits)
    }

    /// Subnet-directed broadcast address of this interface.
    pub fn broadcast(&self) -> Ipv4Addr {
        let mask = u32::from(self.netmask());
        Ipv4Addr::from(u32::from(self.local.ip()) | !mask)
    }

    /// Destination used for flooding out of this interface.
    ///
    /// A host route (/32) has no subnet to direct a broadcast at, so the
    /// limited broadcast address is used instead.
    pub fn flood_destination(&self) -> Ipv4Addr {
        if self.prefix_len == 32 { Ipv4Addr::BROADCAST } else { self.broadcast() }
    }

    pub fn is_loopback(&self) -> bool {
        self.local.ip().is_loopback()
    }
}

/// Role of a node in the localization protocol.
///
/// Beacons know their position a priori and announce it; unknown nodes carry
/// the latest position fix they computed, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeRole {
    Beacon { true_position: Position },
    Unknown { estimate: Option<Position> },
}

impl NodeRole {
    pub fn is_beacon(&self) -> bool {
        matches!(self, NodeRole::Beacon { .. })
    }

    /// Best position this node can report: the true position for a beacon,
    /// the latest estimate for an unknown node.
    pub fn position(&self) -> Option<Position> {
        match self {
            NodeRole::Beacon { true_position } => Some(*true_position),
            NodeRole::Unknown { estimate } => *estimate,
        }
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Unknown { estimate: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_destination_follows_netmask() {
        let iface = Interface::new(NodeAddress::from_octets([10, 0, 0, 7]), 8);
        assert_eq!(iface.netmask(), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(iface.flood_destination(), Ipv4Addr::new(10, 255, 255, 255));

        let host = Interface::new(NodeAddress::from_octets([10, 0, 0, 7]), 32);
        assert_eq!(host.flood_destination(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn special_addresses_are_not_node_identities() {
        assert!(NodeAddress::from_octets([10, 0, 0, 1]).is_node_identity());
        assert!(!NodeAddress::from_octets([0, 0, 0, 0]).is_node_identity());
        assert!(!NodeAddress::from_octets([255, 255, 255, 255]).is_node_identity());
        assert!(!NodeAddress::from_octets([224, 0, 0, 1]).is_node_identity());
        assert!(!NodeAddress::from_octets([127, 0, 0, 1]).is_node_identity());
        assert!(!NodeAddress::from_octets([240, 0, 0, 1]).is_node_identity());
        assert!(!NodeAddress::from_octets([255, 255, 255, 200]).is_node_identity());
        assert!(NodeAddress::from_octets([223, 255, 255, 254]).is_node_identity());
    }

    #[test]
    fn role_position_prefers_truth_for_beacons() {
        let beacon = NodeRole::Beacon {
            true_position: Position::new(1.0, 2.0),
        };
        assert_eq!(beacon.position(), Some(Position::new(1.0, 2.0)));
        assert_eq!(NodeRole::default().position(), None);
    }
}
