//! Type definitions for the simulation.
//!
//! Contains all data structures exchanged between tasks:
//! - frames delivered by the medium and the interface failure signal
//! - node output messages (broadcasts, reports, dumps)
//! - simulation events forwarded to the main thread
//! - the bounded channels carrying them

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use serde::Serialize;

use crate::protocol::flooding::{ProtocolConfig, ProtocolCounters};
use crate::protocol::packet::FLOODING_PACKET_SIZE;
use crate::protocol::types::{Interface, NodeAddress, Position};

/// Upper bound of nodes in one scene; sizes the node task pool.
pub const MAX_NODE_COUNT: usize = 1024;

/// Depth of the per-node input channel (medium → node).
///
/// One hello period of a dense neighbourhood can land at once, so this is
/// sized for roughly (neighbours × known beacons). Overflowing frames are
/// dropped like on a congested radio.
pub const NODE_INPUT_QUEUE_SIZE: usize = 256;
pub type NodeInputQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, NODE_INPUT_QUEUE_SIZE>;
pub type NodeInputQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, NODE_INPUT_QUEUE_SIZE>;
pub type NodeInputQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, NODE_INPUT_QUEUE_SIZE>;

/// Raised by the network task when a node's interface fails. Raising it
/// never blocks the network task.
pub type InterfaceFailureSignal = embassy_sync::signal::Signal<CriticalSectionRawMutex, ()>;

/// Depth of the shared output channel (nodes → network task). Node tasks
/// await space, so this only bounds burstiness.
pub const NODES_OUTPUT_BUFFER_CAPACITY: usize = 64;
pub type NodesOutputQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, NodeOutputMessage, NODES_OUTPUT_BUFFER_CAPACITY>;
pub type NodesOutputQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, NodeOutputMessage, NODES_OUTPUT_BUFFER_CAPACITY>;

/// Depth of the channel towards the main thread.
pub const SIMULATION_EVENT_QUEUE_SIZE: usize = 128;
pub type SimulationEventQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, SimulationEvent, SIMULATION_EVENT_QUEUE_SIZE>;
pub type SimulationEventReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, SimulationEvent, SIMULATION_EVENT_QUEUE_SIZE>;
pub type SimulationEventSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, SimulationEvent, SIMULATION_EVENT_QUEUE_SIZE>;

/// Everything a node task needs to boot.
#[derive(Debug, Clone)]
pub struct NodeSetup {
    pub node_id: u32,
    pub interface: Interface,
    pub true_position: Position,
    pub is_beacon: bool,
    pub protocol: ProtocolConfig,
    pub seed: u64,
    pub schedule: ReportSchedule,
}

/// Virtual instants at which a node reports, shared by all nodes of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSchedule {
    pub start: Instant,
    pub end: Instant,
    pub report_interval: embassy_time::Duration,
    pub routes_dump_at: Option<Instant>,
    pub distances_dump_at: Option<Instant>,
}

/// A frame heard on one of the node's interfaces.
pub struct ReceivedFrame {
    pub interface: NodeAddress,
    pub source: NodeAddress,
    pub frame: [u8; FLOODING_PACKET_SIZE],
}

/// One row of the localization log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocalizationRecord {
    /// Virtual time since the start of the run.
    pub time_ms: u64,
    pub node_id: u32,
    pub is_beacon: bool,
    pub real: Position,
    /// Beacons report their true position; unknown nodes their latest fix.
    pub estimated: Option<Position>,
}

impl LocalizationRecord {
    pub fn error(&self) -> Option<f64> {
        self.estimated.map(|e| e.distance_to(&self.real))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Routes,
    Distances,
}

pub enum NodeOutputPayload {
    /// Frame put on air from `interface`.
    Broadcast { interface: NodeAddress, frame: [u8; FLOODING_PACKET_SIZE] },
    Localization(LocalizationRecord),
    Dump(DumpKind, String),
    /// Final report was sent; the node task is exiting.
    Finished(ProtocolCounters),
}

/// Envelope for events emitted by node tasks into the network loop.
pub struct NodeOutputMessage {
    pub node_id: u32,
    pub payload: NodeOutputPayload,
}

/// Medium-level counters for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediumCounters {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub lost: u64,
    pub queue_overflows: u64,
}

/// What the main thread is told.
pub enum SimulationEvent {
    Localization(LocalizationRecord),
    Dump { kind: DumpKind, node_id: u32, text: String },
    Finished { node_id: u32, counters: ProtocolCounters },
    Completed(MediumCounters),
}
