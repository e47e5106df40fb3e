//! Error taxonomy of the protocol engine.
//!
//! Every error here is recoverable: a decode failure costs one packet, an
//! estimation failure keeps the previous fix, a routing failure is reported
//! to the caller of the lookup. None of them stops a node.

use std::fmt;
use std::net::Ipv4Addr;

/// Failure to parse a flooding packet from received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header size were available.
    TruncatedPacket { len: usize },
    /// The beacon address field does not name a single node.
    MalformedAddress(Ipv4Addr),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TruncatedPacket { len } => {
                write!(f, "truncated packet: {} bytes, need {}", len, super::packet::FLOODING_PACKET_SIZE)
            }
            DecodeError::MalformedAddress(addr) => write!(f, "malformed beacon address {}", addr),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure to compute a position fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationError {
    /// Anchors are coincident or collinear; no unique 2-D solution exists.
    DegenerateGeometry,
    /// Fewer than three beacons are known.
    InsufficientBeacons { have: usize },
}

impl fmt::Display for EstimationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimationError::DegenerateGeometry => write!(f, "degenerate anchor geometry"),
            EstimationError::InsufficientBeacons { have } => {
                write!(f, "insufficient beacons: need 3, have {}", have)
            }
        }
    }
}

impl std::error::Error for EstimationError {}

/// Failure of a route lookup at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    /// The node has no attached interfaces.
    NoInterfacesConfigured,
    /// No route exists; data-plane forwarding is not performed.
    NoRouteToHost,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::NoInterfacesConfigured => write!(f, "no interfaces configured"),
            RoutingError::NoRouteToHost => write!(f, "no route to host"),
        }
    }
}

impl std::error::Error for RoutingError {}
