//! Network simulation core module.
//!
//! Runs one `FloodingProtocol` per scene node on the embassy executor and
//! connects them through a shared radio medium:
//! - `types`: channel and message definitions
//! - `medium`: range, shadowing and loss model
//! - `node_task`: per-node task around the protocol state machine
//! - `network`: central task carrying broadcasts and injecting failures
//! - `report`: CSV, dump and summary outputs on the main thread
//!
//! The entry point is `network_task`, spawned by the embassy executor. It
//! talks to the main thread through a `SimulationEventQueue`.

pub mod medium;
pub mod network;
pub mod node_task;
pub mod report;
pub mod types;

pub use network::network_task;
pub use types::{SimulationEvent, SimulationEventQueue};
