//! Per-node asynchronous task logic.
//!
//! Each node runs an independent task that:
//! - Owns one `FloodingProtocol` instance
//! - Fires the hello timer and puts jittered frames on air when they are due
//! - Feeds frames heard from the medium into the protocol
//! - Reports its localization state and table dumps on the run schedule

use embassy_futures::select::{Either3, select3};
use embassy_time::{Instant, Timer};

use crate::protocol::flooding::{FloodingProtocol, ReceiveOutcome, ScheduledTransmission};
use crate::protocol::types::{Interface, Position};

use super::types::{
    DumpKind, InterfaceFailureSignal, LocalizationRecord, MAX_NODE_COUNT, NodeInputQueueReceiver, NodeOutputMessage, NodeOutputPayload,
    NodeSetup, NodesOutputQueueSender, ReceivedFrame, ReportSchedule,
};

/// State of one node between events.
struct NodeContext {
    node_id: u32,
    interface: Interface,
    true_position: Position,
    schedule: ReportSchedule,
    protocol: FloodingProtocol,
    /// Hello frames waiting for their jitter to elapse.
    pending: Vec<ScheduledTransmission>,
    next_report_at: Instant,
    routes_dumped: bool,
    distances_dumped: bool,
    out_tx: NodesOutputQueueSender,
}

impl NodeContext {
    fn initialize(setup: NodeSetup, out_tx: NodesOutputQueueSender) -> Self {
        let start = setup.schedule.start;
        let mut protocol = FloodingProtocol::new(setup.node_id, setup.protocol, setup.seed);
        protocol.add_interface(setup.interface, start);
        if setup.is_beacon {
            protocol.set_is_beacon(true);
            protocol.set_true_position(setup.true_position);
        }
        protocol.start(start);

        Self {
            node_id: setup.node_id,
            interface: setup.interface,
            true_position: setup.true_position,
            schedule: setup.schedule,
            protocol,
            pending: Vec::new(),
            next_report_at: start + setup.schedule.report_interval,
            routes_dumped: setup.schedule.routes_dump_at.is_none(),
            distances_dumped: setup.schedule.distances_dump_at.is_none(),
            out_tx,
        }
    }

    /// Earliest instant at which something is due.
    fn next_deadline(&self) -> Instant {
        let mut deadline = self.schedule.end.min(self.next_report_at);
        if let Some(at) = self.protocol.next_hello_at() {
            deadline = deadline.min(at);
        }
        if let Some(at) = self.pending.iter().map(|tx| tx.due).min() {
            deadline = deadline.min(at);
        }
        if let (false, Some(at)) = (self.routes_dumped, self.schedule.routes_dump_at) {
            deadline = deadline.min(at);
        }
        if let (false, Some(at)) = (self.distances_dumped, self.schedule.distances_dump_at) {
            deadline = deadline.min(at);
        }
        deadline
    }

    async fn send(&self, payload: NodeOutputPayload) {
        self.out_tx
            .send(NodeOutputMessage {
                node_id: self.node_id,
                payload,
            })
            .await;
    }

    fn handle_frame(&mut self, received: ReceivedFrame) {
        // Decode failures are logged and counted by the protocol.
        if let Ok(ReceiveOutcome::Recorded { estimate: Some(Err(err)), .. }) =
            self.protocol.on_packet(received.interface, received.source, &received.frame, Instant::now())
        {
            log::trace!("[{}] no position fix yet: {}", self.node_id, err);
        }
    }

    fn handle_interface_failure(&mut self) {
        log::info!("[{}] interface {} failed", self.node_id, self.interface.local);
        self.protocol.remove_interface(&self.interface.local);
    }

    /// Run everything due at `now`. Returns `true` once the final report went out.
    async fn handle_deadlines(&mut self, now: Instant) -> bool {
        if self.protocol.next_hello_at().is_some_and(|at| at <= now) {
            let scheduled = self.protocol.on_hello_timer(now);
            self.pending.extend(scheduled);
        }

        if self.pending.iter().any(|tx| tx.due <= now) {
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending).into_iter().partition(|tx| tx.due <= now);
            self.pending = waiting;
            for tx in due {
                if let Some(tx) = self.protocol.release(tx) {
                    self.send(NodeOutputPayload::Broadcast {
                        interface: tx.interface,
                        frame: tx.frame,
                    })
                    .await;
                }
            }
        }

        if let (false, Some(at)) = (self.routes_dumped, self.schedule.routes_dump_at) {
            if at <= now {
                self.routes_dumped = true;
                self.send(NodeOutputPayload::Dump(DumpKind::Routes, self.protocol.routing_table_dump())).await;
            }
        }
        if let (false, Some(at)) = (self.distances_dumped, self.schedule.distances_dump_at) {
            if at <= now {
                self.distances_dumped = true;
                self.send(NodeOutputPayload::Dump(DumpKind::Distances, self.protocol.distance_table_dump())).await;
            }
        }

        // Periodic reports stop short of the end; the final one is sent below.
        while self.next_report_at <= now && self.next_report_at < self.schedule.end {
            let at = self.next_report_at;
            self.send(NodeOutputPayload::Localization(self.localization_record(at))).await;
            self.next_report_at = at + self.schedule.report_interval;
        }

        if now >= self.schedule.end {
            self.send(NodeOutputPayload::Localization(self.localization_record(self.schedule.end))).await;
            self.send(NodeOutputPayload::Finished(*self.protocol.counters())).await;
            return true;
        }
        false
    }

    fn localization_record(&self, at: Instant) -> LocalizationRecord {
        LocalizationRecord {
            time_ms: at.duration_since(self.schedule.start).as_millis(),
            node_id: self.node_id,
            is_beacon: self.protocol.is_beacon(),
            real: self.true_position,
            estimated: self.protocol.role().position(),
        }
    }
}

/// Per-node asynchronous task driving one protocol instance.
///
/// Responsibilities:
/// - Wake on the earliest of: hello timer, due jittered frames, reports.
/// - Deliver frames arriving from the network task to the protocol.
/// - Take the interface down when `failure` is raised.
/// - Exit after sending the final localization report.
#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub async fn node_task(
    setup: NodeSetup,
    out_tx: NodesOutputQueueSender,
    in_rx: NodeInputQueueReceiver,
    failure: &'static InterfaceFailureSignal,
) {
    let mut context = NodeContext::initialize(setup, out_tx);

    loop {
        match select3(in_rx.receive(), failure.wait(), Timer::at(context.next_deadline())).await {
            Either3::First(received) => context.handle_frame(received),
            Either3::Second(()) => context.handle_interface_failure(),
            Either3::Third(()) => {
                if context.handle_deadlines(Instant::now()).await {
                    break;
                }
            }
        }
    }

    log::debug!("[{}] finished", context.node_id);
}
