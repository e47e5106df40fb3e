//! DV-Hop range-free localization over simulated IPv4 flooding.
//!
//! `protocol` holds the per-node engine, `simulation` runs a whole network of
//! them on the embassy executor under a virtual clock.

pub mod common;
pub mod config;
pub mod protocol;
pub mod simulation;
pub mod time_driver;
