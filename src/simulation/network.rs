//! Central network task driving the shared medium.
//!
//! High-level flow:
//! 1) Spawn one `node_task` per scene node, all sharing the same start instant.
//! 2) `select` waits for either a node event or the next scheduled failure.
//! 3) Broadcasts are carried to every node the medium lets hear them.
//! 4) Reports and dumps are forwarded to the main thread.
//! 5) Once every node has sent its final report the run is complete.

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};

use crate::common::scene::Scene;
use crate::config::SimulationConfig;
use crate::protocol::types::{Interface, NodeAddress, Position};

use super::medium::RadioMedium;
use super::node_task::node_task;
use super::types::{
    InterfaceFailureSignal, MediumCounters, NodeInputQueue, NodeInputQueueSender, NodeOutputMessage, NodeOutputPayload, NodeSetup,
    NodesOutputQueue, ReceivedFrame, ReportSchedule, SimulationEvent, SimulationEventSender,
};

/// Seed offset so the medium does not replay the beacon selection stream.
const MEDIUM_SEED_SALT: u64 = 0x6d65_6469_756d;

/// Network-side view of a node.
struct NodeRuntime {
    interface: Interface,
    position: Position,
    input: Option<NodeInputQueueSender>,
    failure: Option<&'static InterfaceFailureSignal>,
    /// Interface still up.
    alive: bool,
    finished: bool,
}

/// Build the report schedule of a run starting at `start`.
fn report_schedule(config: &SimulationConfig, start: Instant) -> ReportSchedule {
    ReportSchedule {
        start,
        end: start + Duration::from_millis(config.duration_ms),
        report_interval: Duration::from_millis(config.report_interval_ms),
        routes_dump_at: config.routes_dump_at_ms.map(|ms| start + Duration::from_millis(ms)),
        distances_dump_at: config.distances_dump_at_ms.map(|ms| start + Duration::from_millis(ms)),
    }
}

/// Spawn node tasks for every node of the scene.
///
/// A node whose task cannot be spawned is logged and counted as finished so
/// the run still completes.
///
/// # Parameters
///
/// * `spawner` - Embassy spawner for creating async tasks
/// * `scene` - The loaded scene
/// * `config` - Run configuration (seed)
/// * `schedule` - Shared report schedule
/// * `nodes_output_channel` - Shared output channel for all nodes
///
/// # Returns
///
/// Runtime entries indexed by node id.
fn initialize_nodes(
    spawner: &Spawner,
    scene: &Scene,
    config: &SimulationConfig,
    schedule: ReportSchedule,
    nodes_output_channel: &'static NodesOutputQueue,
) -> Vec<NodeRuntime> {
    let positions = scene.positions();
    let beacons = scene.select_beacons(config.seed);
    let protocol = scene.protocol_config();
    let mut nodes = Vec::with_capacity(positions.len());

    for (index, position) in positions.into_iter().enumerate() {
        let node_id = index as u32;
        let interface = scene.interface_of(node_id);
        if beacons[index] {
            log::info!("Node {} ({}) is a beacon at {}", node_id, interface.local, position);
        }

        // INTENTIONAL LEAK: embassy channels handed to tasks need a 'static lifetime.
        // They live for the whole run and go away with the process.
        let node_input_channel: &'static NodeInputQueue = Box::leak(Box::new(NodeInputQueue::new()));
        let failure: &'static InterfaceFailureSignal = Box::leak(Box::new(InterfaceFailureSignal::new()));
        let setup = NodeSetup {
            node_id,
            interface,
            true_position: position,
            is_beacon: beacons[index],
            protocol,
            seed: config.seed.wrapping_add(node_id as u64 + 1),
            schedule,
        };
        let spawned = spawner.spawn(node_task(setup, nodes_output_channel.sender(), node_input_channel.receiver(), failure));
        if spawned.is_err() {
            log::error!("Failed to spawn task for node {}", node_id);
        }

        nodes.push(NodeRuntime {
            interface,
            position,
            input: spawned.is_ok().then(|| node_input_channel.sender()),
            failure: spawned.is_ok().then_some(failure),
            alive: spawned.is_ok(),
            finished: spawned.is_err(),
        });
    }

    nodes
}

/// Carry a broadcast from `sender_id` to every node that hears it.
///
/// Receivers whose input queue is full lose the frame.
fn handle_broadcast(
    sender_id: u32,
    interface: NodeAddress,
    frame: [u8; crate::protocol::packet::FLOODING_PACKET_SIZE],
    nodes: &[NodeRuntime],
    medium: &mut RadioMedium,
    counters: &mut MediumCounters,
) {
    let sender_index = sender_id as usize;
    if !nodes.get(sender_index).is_some_and(|n| n.alive) {
        return;
    }
    counters.broadcasts += 1;

    let positions: Vec<Position> = nodes.iter().map(|n| n.position).collect();
    let listening: Vec<bool> = nodes.iter().map(|n| n.alive && !n.finished).collect();
    let (receivers, lost) = medium.receivers(sender_index, &positions, &listening);
    counters.lost += lost;

    for receiver in receivers {
        let node = &nodes[receiver];
        let Some(input) = &node.input else {
            continue;
        };
        let message = ReceivedFrame {
            interface: node.interface.local,
            source: interface,
            frame,
        };
        if input.try_send(message).is_ok() {
            counters.deliveries += 1;
        } else {
            counters.queue_overflows += 1;
            log::warn!("Node {} input queue full, dropping frame from node {}", receiver, sender_id);
        }
    }
}

/// Take down the interfaces of every failure due at `now`.
fn inject_due_failures(failures: &mut Vec<(Instant, u32)>, nodes: &mut [NodeRuntime], now: Instant) {
    while let Some(&(at, node_id)) = failures.first() {
        if at > now {
            break;
        }
        failures.remove(0);

        let Some(node) = nodes.get_mut(node_id as usize) else {
            continue;
        };
        if !node.alive {
            continue;
        }
        node.alive = false;
        log::info!("Node {} interface {} goes down", node_id, node.interface.local);
        if let Some(failure) = node.failure {
            failure.signal(());
        }
    }
}

/// Central network task: owns the medium and the node registry.
///
/// Terminates after forwarding `SimulationEvent::Completed`.
#[embassy_executor::task]
pub async fn network_task(spawner: Spawner, scene: Scene, config: SimulationConfig, events_tx: SimulationEventSender) {
    let start = Instant::now();
    let schedule = report_schedule(&config, start);

    // INTENTIONAL LEAK: see `initialize_nodes`.
    let nodes_output_channel: &'static NodesOutputQueue = Box::leak(Box::new(NodesOutputQueue::new()));
    let mut nodes = initialize_nodes(&spawner, &scene, &config, schedule, nodes_output_channel);
    log::info!("Spawned {} nodes, run ends after {} ms", nodes.len(), config.duration_ms);

    let mut failures: Vec<(Instant, u32)> = scene
        .failures
        .iter()
        .map(|f| (start + Duration::from_millis(f.at_ms), f.node_id))
        .collect();
    failures.sort();

    let mut medium = RadioMedium::new(&scene.radio, config.seed ^ MEDIUM_SEED_SALT);
    let mut counters = MediumCounters::default();

    while !nodes.iter().all(|n| n.finished) {
        // Nothing scheduled: wake up hourly, the node events drive the run.
        let next_failure = failures.first().map(|(at, _)| *at).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        match select(nodes_output_channel.receive(), Timer::at(next_failure)).await {
            Either::First(NodeOutputMessage { node_id, payload }) => match payload {
                NodeOutputPayload::Broadcast { interface, frame } => {
                    handle_broadcast(node_id, interface, frame, &nodes, &mut medium, &mut counters);
                }
                NodeOutputPayload::Localization(record) => {
                    events_tx.send(SimulationEvent::Localization(record)).await;
                }
                NodeOutputPayload::Dump(kind, text) => {
                    events_tx.send(SimulationEvent::Dump { kind, node_id, text }).await;
                }
                NodeOutputPayload::Finished(node_counters) => {
                    if let Some(node) = nodes.get_mut(node_id as usize) {
                        node.finished = true;
                    }
                    events_tx
                        .send(SimulationEvent::Finished {
                            node_id,
                            counters: node_counters,
                        })
                        .await;
                }
            },
            Either::Second(()) => inject_due_failures(&mut failures, &mut nodes, Instant::now()),
        }
    }

    log::info!(
        "All nodes finished: {} broadcasts, {} deliveries, {} lost, {} dropped on full queues",
        counters.broadcasts,
        counters.deliveries,
        counters.lost,
        counters.queue_overflows
    );
    events_tx.send(SimulationEvent::Completed(counters)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_relative_to_start() {
        let start = Instant::from_millis(500);
        let schedule = report_schedule(&SimulationConfig::default(), start);
        assert_eq!(schedule.end, Instant::from_millis(10_500));
        assert_eq!(schedule.report_interval, Duration::from_secs(1));
        assert_eq!(schedule.routes_dump_at, Some(Instant::from_millis(8_500)));
        assert_eq!(schedule.distances_dump_at, Some(Instant::from_millis(9_500)));
    }

    #[test]
    fn broadcasts_from_failed_nodes_are_not_carried() {
        let params = crate::common::scene::RadioParameters {
            range: 60.0,
            loss_probability: 0.0,
            shadowing_sigma: 0.0,
        };
        let mut medium = RadioMedium::new(&params, 1);
        let mut counters = MediumCounters::default();
        let nodes = vec![NodeRuntime {
            interface: Interface::new(NodeAddress::from_octets([10, 0, 0, 1]), 8),
            position: Position::ORIGIN,
            input: None,
            failure: None,
            alive: false,
            finished: false,
        }];
        handle_broadcast(0, NodeAddress::from_octets([10, 0, 0, 1]), [0; 24], &nodes, &mut medium, &mut counters);
        assert_eq!(counters, MediumCounters::default());
    }
}
