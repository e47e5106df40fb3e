//! DV-Hop protocol core.
//!
//! Everything here is sans-IO: time enters as an explicit `Instant`, frames
//! leave as `ScheduledTransmission`s and the caller owns the event loop.
//!
//! - `types`: addresses, positions, interfaces, node roles
//! - `packet`: the 24-byte flooding announcement codec
//! - `distance_table`: per-beacon hop counts and positions
//! - `trilateration`: position estimation from ranged beacons
//! - `flooding`: the per-node protocol state machine

pub mod distance_table;
pub mod error;
pub mod flooding;
pub mod packet;
pub mod trilateration;
pub mod types;

pub use flooding::{FloodingProtocol, ProtocolConfig};
