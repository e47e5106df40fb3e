//! DV-Hop flooding state machine.
//!
//! One `FloodingProtocol` runs per node. It is plain data driven by its host:
//! - `on_hello_timer` when the hello deadline is reached, which returns the
//!   jittered transmissions the host should carry out later,
//! - `release` right before a scheduled transmission goes on air, which drops
//!   transmissions whose timer generation was cancelled in the meantime,
//! - `on_packet` for every frame received on one of the node's interfaces.
//!
//! Nothing here blocks or sleeps; the host owns the clock and the medium.

use embassy_time::{Duration, Instant};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use super::distance_table::{DistanceTable, UpdateOutcome};
use super::error::{DecodeError, EstimationError, RoutingError};
use super::packet::{FLOODING_PACKET_SIZE, FloodingPacket};
use super::trilateration::{EstimationStrategy, RangedAnchor, estimate};
use super::types::{Interface, NodeAddress, NodeRole, Position};

/// Tunables of the protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolConfig {
    /// Period of the hello broadcast.
    pub hello_interval: Duration,
    /// Upper bound (inclusive, whole milliseconds) of the per-transmission jitter.
    pub max_jitter: Duration,
    /// Distance one hop is assumed to cover when turning hops into ranges.
    pub hop_unit_distance: f64,
    pub estimation: EstimationStrategy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hello_interval: Duration::from_secs(1),
            max_jitter: Duration::from_millis(10),
            hop_unit_distance: 50.0,
            estimation: EstimationStrategy::NearestTriple,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Stopped,
    Running,
}

/// Role plus the node's sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeState {
    pub role: NodeRole,
    sequence: u16,
}

impl NodeState {
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

/// A hello packet waiting for its jitter to elapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTransmission {
    pub due: Instant,
    pub interface: NodeAddress,
    pub destination: Ipv4Addr,
    pub frame: [u8; FLOODING_PACKET_SIZE],
    generation: u64,
}

impl ScheduledTransmission {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What happened to a received frame that decoded successfully.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiveOutcome {
    /// Arrived on an interface that is not attached (any more).
    NotListening,
    /// Advertised one of our own addresses; never recorded.
    OwnAnnouncement,
    Recorded {
        beacon: NodeAddress,
        update: UpdateOutcome,
        /// Present when an estimation was attempted after the update.
        estimate: Option<Result<Position, EstimationError>>,
    },
}

/// One-hop route handed out for the protocol's own control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub source: NodeAddress,
    pub interface: NodeAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRoute {
    LocalDelivery,
    /// Hand the packet on along `Route`.
    Forward(Route),
}

/// Traffic counters kept for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProtocolCounters {
    pub scheduled: u64,
    pub released: u64,
    pub cancelled: u64,
    pub received: u64,
    pub decode_errors: u64,
    pub own_announcements: u64,
    pub accepted_updates: u64,
    pub discarded_updates: u64,
}

impl std::ops::AddAssign for ProtocolCounters {
    fn add_assign(&mut self, other: Self) {
        self.scheduled += other.scheduled;
        self.released += other.released;
        self.cancelled += other.cancelled;
        self.received += other.received;
        self.decode_errors += other.decode_errors;
        self.own_announcements += other.own_announcements;
        self.accepted_updates += other.accepted_updates;
        self.discarded_updates += other.discarded_updates;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HelloTimer {
    generation: u64,
    deadline: Option<Instant>,
}

/// Protocol instance of one node.
pub struct FloodingProtocol {
    node_id: u32,
    config: ProtocolConfig,
    state: ProtocolState,
    node: NodeState,
    table: DistanceTable,
    interfaces: Vec<Interface>,
    timer: HelloTimer,
    rng: StdRng,
    counters: ProtocolCounters,
}

impl FloodingProtocol {
    /// Create a stopped instance. `seed` drives the transmission jitter.
    pub fn new(node_id: u32, config: ProtocolConfig, seed: u64) -> Self {
        Self {
            node_id,
            config,
            state: ProtocolState::Stopped,
            node: NodeState::default(),
            table: DistanceTable::new(),
            interfaces: Vec::new(),
            timer: HelloTimer::default(),
            rng: StdRng::seed_from_u64(seed),
            counters: ProtocolCounters::default(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn node_state(&self) -> &NodeState {
        &self.node
    }

    pub fn role(&self) -> &NodeRole {
        &self.node.role
    }

    pub fn is_beacon(&self) -> bool {
        self.node.role.is_beacon()
    }

    /// Latest position fix, `None` for beacons and for unknown nodes without one.
    pub fn estimated_position(&self) -> Option<Position> {
        match self.node.role {
            NodeRole::Unknown { estimate } => estimate,
            NodeRole::Beacon { .. } => None,
        }
    }

    pub fn distance_table(&self) -> &DistanceTable {
        &self.table
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn counters(&self) -> &ProtocolCounters {
        &self.counters
    }

    /// Switch between beacon and unknown role.
    ///
    /// A node that becomes a beacon announces the origin until
    /// `set_true_position` supplies its real coordinates; a node that stops
    /// being a beacon starts without an estimate.
    pub fn set_is_beacon(&mut self, is_beacon: bool) {
        match (is_beacon, self.node.role) {
            (true, NodeRole::Unknown { .. }) => {
                log::debug!("[{}] became a beacon", self.node_id);
                self.node.role = NodeRole::Beacon {
                    true_position: Position::ORIGIN,
                };
            }
            (false, NodeRole::Beacon { .. }) => {
                log::debug!("[{}] is no longer a beacon", self.node_id);
                self.node.role = NodeRole::Unknown { estimate: None };
            }
            _ => {}
        }
    }

    /// Set the position a beacon announces. Unknown nodes ignore it: ground
    /// truth never feeds their estimate.
    pub fn set_true_position(&mut self, position: Position) {
        match &mut self.node.role {
            NodeRole::Beacon { true_position } => *true_position = position,
            NodeRole::Unknown { .. } => {
                log::debug!("[{}] ignoring true position {} on a non-beacon node", self.node_id, position);
            }
        }
    }

    /// Attach an interface. Loopback and already attached addresses are refused.
    ///
    /// If the protocol is running without a hello deadline (all interfaces
    /// were down) the timer is rearmed from `now`.
    pub fn add_interface(&mut self, interface: Interface, now: Instant) -> bool {
        if interface.is_loopback() {
            return false;
        }
        if self.is_local_address(&interface.local) {
            log::warn!(
                "[{}] interface {} already attached; one address per interface is supported",
                self.node_id,
                interface.local
            );
            return false;
        }

        self.interfaces.push(interface);
        log::debug!("[{}] interface {}/{} up", self.node_id, interface.local, interface.prefix_len);

        if self.state == ProtocolState::Running && self.timer.deadline.is_none() {
            self.timer.deadline = Some(now + self.config.hello_interval);
        }
        true
    }

    /// Detach an interface. Losing the last one cancels the hello timer.
    pub fn remove_interface(&mut self, local: &NodeAddress) -> bool {
        let before = self.interfaces.len();
        self.interfaces.retain(|i| i.local != *local);
        if self.interfaces.len() == before {
            return false;
        }

        log::debug!("[{}] interface {} down", self.node_id, local);
        if self.interfaces.is_empty() {
            log::info!("[{}] no interfaces left, hello timer cancelled", self.node_id);
            self.cancel_hello_timer();
        }
        true
    }

    pub fn is_local_address(&self, address: &NodeAddress) -> bool {
        self.interfaces.iter().any(|i| i.local == *address)
    }

    /// Move from `Stopped` to `Running` and arm the first hello.
    pub fn start(&mut self, now: Instant) {
        if self.state == ProtocolState::Running {
            return;
        }
        self.state = ProtocolState::Running;
        if !self.interfaces.is_empty() {
            self.timer.deadline = Some(now + self.config.hello_interval);
        }
        log::info!(
            "[{}] started as {}",
            self.node_id,
            if self.is_beacon() { "beacon" } else { "unknown node" }
        );
    }

    pub fn next_hello_at(&self) -> Option<Instant> {
        self.timer.deadline
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer.generation
    }

    /// Stop the hello timer and invalidate every transmission it scheduled.
    pub fn cancel_hello_timer(&mut self) {
        self.timer.deadline = None;
        self.timer.generation = self.timer.generation.wrapping_add(1);
    }

    /// Build this period's hello packets and rearm the timer.
    ///
    /// Per interface: one packet per known beacon carrying the stored hop
    /// count (the receiver adds the hop), plus a zero-hop self announcement
    /// when this node is a beacon. Each packet gets its own jitter.
    pub fn on_hello_timer(&mut self, now: Instant) -> Vec<ScheduledTransmission> {
        if self.state != ProtocolState::Running || self.timer.deadline.is_none() {
            return Vec::new();
        }
        if self.interfaces.is_empty() {
            self.timer.deadline = None;
            return Vec::new();
        }

        let mut scheduled = Vec::new();
        let interfaces = self.interfaces.clone();
        for interface in &interfaces {
            let destination = interface.flood_destination();

            for beacon in self.table.known_beacons() {
                let Some(record) = self.table.get(&beacon).copied() else {
                    continue;
                };
                let sequence = self.node.next_sequence();
                let packet = FloodingPacket::new(beacon, record.hop_count, sequence, record.position);
                scheduled.push(self.schedule(packet, interface, destination, now));
            }

            if let NodeRole::Beacon { true_position } = self.node.role {
                let sequence = self.node.next_sequence();
                let packet = FloodingPacket::new(interface.local, 0, sequence, true_position);
                scheduled.push(self.schedule(packet, interface, destination, now));
            }
        }

        log::trace!("[{}] hello: {} packets scheduled", self.node_id, scheduled.len());
        self.counters.scheduled += scheduled.len() as u64;
        self.timer.deadline = Some(now + self.config.hello_interval);
        scheduled
    }

    fn schedule(&mut self, packet: FloodingPacket, interface: &Interface, destination: Ipv4Addr, now: Instant) -> ScheduledTransmission {
        let max_jitter_ms = self.config.max_jitter.as_millis();
        let jitter = Duration::from_millis(self.rng.gen_range(0..=max_jitter_ms));
        ScheduledTransmission {
            due: now + jitter,
            interface: interface.local,
            destination,
            frame: packet.encode(),
            generation: self.timer.generation,
        }
    }

    /// Hand a due transmission back for sending, or swallow it if its timer
    /// generation was cancelled or its interface went away.
    pub fn release(&mut self, transmission: ScheduledTransmission) -> Option<ScheduledTransmission> {
        if transmission.generation != self.timer.generation || !self.is_local_address(&transmission.interface) {
            self.counters.cancelled += 1;
            log::trace!("[{}] dropping transmission of a cancelled hello", self.node_id);
            return None;
        }
        self.counters.released += 1;
        Some(transmission)
    }

    /// Process a frame received on `interface` from `source`.
    ///
    /// # Errors
    ///
    /// The frame's `DecodeError`; the frame is dropped and nothing changes.
    pub fn on_packet(&mut self, interface: NodeAddress, source: NodeAddress, bytes: &[u8], now: Instant) -> Result<ReceiveOutcome, DecodeError> {
        if !self.is_local_address(&interface) {
            return Ok(ReceiveOutcome::NotListening);
        }
        self.counters.received += 1;

        let packet = match FloodingPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                self.counters.decode_errors += 1;
                log::warn!("[{}] dropping packet from {}: {}", self.node_id, source, err);
                return Err(err);
            }
        };
        log::trace!("[{}] from {} seq {}: {}", self.node_id, source, packet.sequence_number(), packet);

        let beacon = packet.beacon_address();
        let Some(update) = self.update_hops_to(beacon, packet.hop_count().saturating_add(1), packet.position(), now) else {
            self.counters.own_announcements += 1;
            return Ok(ReceiveOutcome::OwnAnnouncement);
        };

        let estimate = if !self.is_beacon() && self.table.len() >= 3 {
            Some(self.refresh_estimate())
        } else {
            None
        };

        Ok(ReceiveOutcome::Recorded { beacon, update, estimate })
    }

    /// Apply the shortest-path rule for `beacon`. Returns `None` when the
    /// beacon is this node itself.
    pub fn update_hops_to(&mut self, beacon: NodeAddress, hops: u16, position: Position, now: Instant) -> Option<UpdateOutcome> {
        if self.is_local_address(&beacon) {
            log::trace!("[{}] local address {}, not updating table", self.node_id, beacon);
            return None;
        }

        let outcome = self.table.record_update(beacon, hops, position.x, position.y, now);
        match outcome {
            UpdateOutcome::Inserted => {
                self.counters.accepted_updates += 1;
                log::debug!("[{}] new beacon {} at {} hops {}", self.node_id, beacon, hops, position);
            }
            UpdateOutcome::Improved { previous_hops } => {
                self.counters.accepted_updates += 1;
                log::debug!("[{}] shorter path to {}: {} -> {} hops", self.node_id, beacon, previous_hops, hops);
            }
            UpdateOutcome::Discarded { .. } => self.counters.discarded_updates += 1,
        }
        Some(outcome)
    }

    /// Recompute the position fix from the distance table.
    ///
    /// On success the fix replaces the stored estimate; on failure the
    /// previous estimate is kept. Beacons never store an estimate.
    pub fn refresh_estimate(&mut self) -> Result<Position, EstimationError> {
        let pool = self.config.estimation.pool_size();
        let anchors: Vec<RangedAnchor> = self
            .table
            .nearest(pool)
            .into_iter()
            .map(|(_, record)| RangedAnchor {
                position: record.position,
                range: record.hop_count as f64 * self.config.hop_unit_distance,
            })
            .collect();

        match estimate(&anchors, self.config.estimation) {
            Ok(fix) => {
                if let NodeRole::Unknown { estimate } = &mut self.node.role {
                    if *estimate != Some(fix) {
                        log::debug!("[{}] position estimate {}", self.node_id, fix);
                    }
                    *estimate = Some(fix);
                }
                Ok(fix)
            }
            Err(err) => {
                log::debug!("[{}] keeping previous estimate: {}", self.node_id, err);
                Err(err)
            }
        }
    }

    /// Route for locally originated packets: one hop out of `interface` (or
    /// the first interface) towards its broadcast address.
    pub fn route_output(&self, destination: Ipv4Addr, interface: Option<NodeAddress>) -> Result<Route, RoutingError> {
        if self.interfaces.is_empty() {
            return Err(RoutingError::NoInterfacesConfigured);
        }
        let iface = match interface {
            Some(local) => self.interfaces.iter().find(|i| i.local == local).ok_or(RoutingError::NoRouteToHost)?,
            None => &self.interfaces[0],
        };
        Ok(Route {
            destination,
            gateway: iface.broadcast(),
            source: iface.local,
            interface: iface.local,
        })
    }

    /// Decide what to do with an incoming IP packet: broadcast and our own
    /// addresses are delivered locally, everything else would need forwarding.
    pub fn route_input(&self, destination: Ipv4Addr, interface: NodeAddress) -> Result<InputRoute, RoutingError> {
        if self.interfaces.is_empty() {
            return Err(RoutingError::NoInterfacesConfigured);
        }
        let iface = self
            .interfaces
            .iter()
            .find(|i| i.local == interface)
            .ok_or(RoutingError::NoRouteToHost)?;

        if destination == iface.broadcast() || destination == Ipv4Addr::BROADCAST {
            return Ok(InputRoute::LocalDelivery);
        }
        if self.is_local_address(&NodeAddress::new(destination)) {
            return Ok(InputRoute::LocalDelivery);
        }
        self.forward(destination).map(InputRoute::Forward)
    }

    /// Data-plane forwarding is not implemented: there is never a route.
    pub fn forward(&self, destination: Ipv4Addr) -> Result<Route, RoutingError> {
        if self.interfaces.is_empty() {
            return Err(RoutingError::NoInterfacesConfigured);
        }
        log::debug!("[{}] not forwarding packet for {}", self.node_id, destination);
        Err(RoutingError::NoRouteToHost)
    }

    /// Routing-table dump: one line per known beacon.
    pub fn routing_table_dump(&self) -> String {
        let mut out = format!("Routing table for Node {}:\n", self.node_id);
        for (beacon, record) in self.table.iter() {
            let _ = writeln!(
                out,
                "Beacon: {} - Hops: {} - Position: ({}, {})",
                beacon, record.hop_count, record.position.x, record.position.y
            );
        }
        out
    }

    /// Distance-table dump framed with the node id.
    pub fn distance_table_dump(&self) -> String {
        format!("----------------- Node {}-----------------\n{}", self.node_id, self.table)
    }
}
