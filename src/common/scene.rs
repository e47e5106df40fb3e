//! Scene loading, parsing, and validation logic.
//!
//! A scene describes one localization experiment:
//! - node layout (regular grid or explicit coordinates)
//! - radio model (range, loss, shadowing)
//! - IPv4 addressing of the nodes
//! - which nodes are beacons
//! - protocol parameters
//! - scheduled interface failures

use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use embassy_time::Duration;

use crate::protocol::flooding::ProtocolConfig;
use crate::protocol::trilateration::{EstimationStrategy, MAX_AVERAGED_BEACONS};
use crate::protocol::types::{Interface, NodeAddress, Position};

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SceneLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneLoadError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneLoadError {}

/// Where the nodes are.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Layout {
    /// `size` nodes placed row first, `grid_width` per row, `step` apart.
    #[serde(rename = "grid")]
    Grid { size: usize, step: f64, grid_width: usize },
    /// One position per node; node ids are the indices.
    #[serde(rename = "explicit")]
    Explicit { positions: Vec<Position> },
}

/// Unit-disk radio with optional range shadowing and random loss.
#[derive(Debug, Clone, Deserialize)]
pub struct RadioParameters {
    /// Nominal communication range in meters.
    pub range: f64,
    /// Probability that a frame in range is still lost.
    #[serde(default)]
    pub loss_probability: f64,
    /// Standard deviation (meters) of the per-frame range perturbation.
    #[serde(default)]
    pub shadowing_sigma: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkParameters {
    /// Node `i` gets `address_base + i + 1`.
    pub address_base: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for NetworkParameters {
    fn default() -> Self {
        Self {
            address_base: Ipv4Addr::new(10, 0, 0, 0),
            prefix_len: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeaconShare {
    OneEighth,
    Quarter,
    Half,
}

impl BeaconShare {
    /// Number of beacons among `node_count` nodes (rounded down).
    pub fn beacon_count(&self, node_count: usize) -> usize {
        match self {
            BeaconShare::OneEighth => node_count / 8,
            BeaconShare::Quarter => node_count / 4,
            BeaconShare::Half => node_count / 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BeaconSelection {
    #[serde(rename = "explicit")]
    Explicit { node_ids: Vec<u32> },
    /// Distinct nodes drawn uniformly with the run seed.
    #[serde(rename = "random")]
    Random { share: BeaconShare },
}

/// Protocol tunables as written in the scene.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolParameters {
    pub hello_interval_ms: u64,
    pub max_jitter_ms: u64,
    /// Meters per hop. Defaults to the grid step, or 50 m for explicit layouts.
    pub hop_unit_distance: Option<f64>,
    pub estimation: EstimationStrategy,
}

impl Default for ProtocolParameters {
    fn default() -> Self {
        Self {
            hello_interval_ms: 1000,
            max_jitter_ms: 10,
            hop_unit_distance: None,
            estimation: EstimationStrategy::default(),
        }
    }
}

/// Node `node_id` loses its interface at `at_ms` into the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InterfaceFailure {
    pub node_id: u32,
    pub at_ms: u64,
}

/// Root structure representing the entire scene.
#[derive(Debug, Clone, Deserialize)]
pub struct Scene {
    pub layout: Layout,
    pub radio: RadioParameters,
    #[serde(default)]
    pub network: NetworkParameters,
    pub beacons: BeaconSelection,
    #[serde(default)]
    pub protocol: ProtocolParameters,
    #[serde(default)]
    pub failures: Vec<InterfaceFailure>,
}

const DEFAULT_HOP_UNIT_DISTANCE: f64 = 50.0;

impl Scene {
    pub fn node_count(&self) -> usize {
        match &self.layout {
            Layout::Grid { size, .. } => *size,
            Layout::Explicit { positions } => positions.len(),
        }
    }

    /// True position of every node, indexed by node id.
    pub fn positions(&self) -> Vec<Position> {
        match &self.layout {
            Layout::Grid { size, step, grid_width } => (0..*size)
                .map(|i| Position::new((i % grid_width) as f64 * step, (i / grid_width) as f64 * step))
                .collect(),
            Layout::Explicit { positions } => positions.clone(),
        }
    }

    /// Interface of node `node_id`. Validation guarantees the address fits.
    pub fn interface_of(&self, node_id: u32) -> Interface {
        let base = u32::from(self.network.address_base);
        let address = Ipv4Addr::from(base.wrapping_add(node_id).wrapping_add(1));
        Interface::new(NodeAddress::new(address), self.network.prefix_len)
    }

    /// Beacon flag per node id.
    pub fn select_beacons(&self, seed: u64) -> Vec<bool> {
        let node_count = self.node_count();
        let mut beacons = vec![false; node_count];
        match &self.beacons {
            BeaconSelection::Explicit { node_ids } => {
                for id in node_ids {
                    beacons[*id as usize] = true;
                }
            }
            BeaconSelection::Random { share } => {
                let mut rng = StdRng::seed_from_u64(seed);
                for id in sample(&mut rng, node_count, share.beacon_count(node_count)) {
                    beacons[id] = true;
                }
            }
        }
        beacons
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        let hop_unit_distance = self.protocol.hop_unit_distance.unwrap_or(match &self.layout {
            Layout::Grid { step, .. } => *step,
            Layout::Explicit { .. } => DEFAULT_HOP_UNIT_DISTANCE,
        });
        ProtocolConfig {
            hello_interval: Duration::from_millis(self.protocol.hello_interval_ms),
            max_jitter: Duration::from_millis(self.protocol.max_jitter_ms),
            hop_unit_distance,
            estimation: self.protocol.estimation,
        }
    }
}

/// Load and parse a scene from a file.
///
/// # Parameters
///
/// * `path` - Path to the scene JSON file
///
/// # Returns
///
/// Parsed and validated Scene or an error.
pub fn load_scene(path: &Path) -> Result<Scene, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;

    let scene: Scene = serde_json::from_str(&data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(format!("{:#}", e)))?;

    validate_scene(&scene).map_err(SceneLoadError::ValidationError)?;

    Ok(scene)
}

/// Validate scene configuration.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_NODES: usize = crate::simulation::types::MAX_NODE_COUNT;

    let node_count = scene.node_count();
    if node_count == 0 {
        return Err("Scene must contain at least one node".to_string());
    }
    if node_count > MAX_NODES {
        return Err(format!("Node count {} exceeds maximum of {}", node_count, MAX_NODES));
    }

    match &scene.layout {
        Layout::Grid { step, grid_width, .. } => {
            if *grid_width == 0 {
                return Err("Grid width must be positive".to_string());
            }
            if !(step.is_finite() && *step > 0.0) {
                return Err(format!("Invalid grid step {}, must be positive", step));
            }
        }
        Layout::Explicit { positions } => {
            if let Some((idx, p)) = positions.iter().enumerate().find(|(_, p)| !p.is_finite()) {
                return Err(format!("Node {} position {} is not finite", idx, p));
            }
        }
    }

    // Radio
    if !(scene.radio.range.is_finite() && scene.radio.range > 0.0) {
        return Err(format!("Invalid radio range {}, must be positive", scene.radio.range));
    }
    if !(0.0..=1.0).contains(&scene.radio.loss_probability) {
        return Err(format!("Invalid loss_probability {}, must be within 0-1", scene.radio.loss_probability));
    }
    if !(scene.radio.shadowing_sigma.is_finite() && scene.radio.shadowing_sigma >= 0.0) {
        return Err("Invalid shadowing_sigma, must be non-negative".to_string());
    }

    // Addressing
    if scene.network.prefix_len > 32 {
        return Err(format!("Invalid prefix_len {}, must be 0-32", scene.network.prefix_len));
    }
    let base = u32::from(scene.network.address_base);
    if base.checked_add(node_count as u32 + 1).is_none() {
        return Err(format!("Address base {} leaves no room for {} nodes", scene.network.address_base, node_count));
    }
    for node_id in 0..node_count as u32 {
        let interface = scene.interface_of(node_id);
        let local = interface.local;
        if !local.is_node_identity() {
            return Err(format!("Node {} would get unusable address {}", node_id, local));
        }
        // /31 and /32 have no network or directed broadcast address.
        if interface.prefix_len < 31 {
            let host_bits = u32::from(local.ip()) & !u32::from(interface.netmask());
            if host_bits == 0 {
                return Err(format!("Node {} would get the network address {}", node_id, local));
            }
            if local.ip() == interface.broadcast() {
                return Err(format!("Node {} would get the subnet broadcast address {}", node_id, local));
            }
        }
    }

    // Beacons
    match &scene.beacons {
        BeaconSelection::Explicit { node_ids } => {
            let mut seen = HashSet::new();
            for id in node_ids {
                if *id as usize >= node_count {
                    return Err(format!("Beacon node_id {} does not exist", id));
                }
                if !seen.insert(*id) {
                    return Err(format!("Duplicate beacon node_id found: {}", id));
                }
            }
        }
        BeaconSelection::Random { share } => {
            if share.beacon_count(node_count) == 0 {
                log::warn!("Beacon share {:?} of {} nodes selects no beacons", share, node_count);
            }
        }
    }

    // Protocol
    if scene.protocol.hello_interval_ms == 0 {
        return Err("hello_interval_ms must be positive".to_string());
    }
    if scene.protocol.max_jitter_ms >= scene.protocol.hello_interval_ms {
        return Err(format!(
            "max_jitter_ms {} must be shorter than hello_interval_ms {}",
            scene.protocol.max_jitter_ms, scene.protocol.hello_interval_ms
        ));
    }
    if let Some(unit) = scene.protocol.hop_unit_distance {
        if !(unit.is_finite() && unit > 0.0) {
            return Err(format!("Invalid hop_unit_distance {}, must be positive", unit));
        }
    }
    if let EstimationStrategy::AveragedTriples { max_beacons } = scene.protocol.estimation {
        if !(3..=MAX_AVERAGED_BEACONS).contains(&max_beacons) {
            return Err(format!(
                "averaged-triples needs max_beacons within 3..={}, got {}",
                MAX_AVERAGED_BEACONS, max_beacons
            ));
        }
    }

    // Failures
    for failure in &scene.failures {
        if failure.node_id as usize >= node_count {
            return Err(format!("Failure scheduled for unknown node {}", failure.node_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID_SCENE: &str = r#"{
        "layout": { "type": "grid", "size": 50, "step": 50.0, "grid_width": 10 },
        "radio": { "range": 60.0 },
        "beacons": { "type": "random", "share": "one-eighth" }
    }"#;

    fn grid_scene() -> Scene {
        serde_json::from_str(GRID_SCENE).unwrap()
    }

    #[test]
    fn grid_is_laid_out_row_first() {
        let scene = grid_scene();
        assert!(validate_scene(&scene).is_ok());
        let positions = scene.positions();
        assert_eq!(positions.len(), 50);
        assert_eq!(positions[0], Position::new(0.0, 0.0));
        assert_eq!(positions[9], Position::new(450.0, 0.0));
        assert_eq!(positions[10], Position::new(0.0, 50.0));
        assert_eq!(positions[49], Position::new(450.0, 200.0));
    }

    #[test]
    fn addresses_start_after_the_base() {
        let scene = grid_scene();
        assert_eq!(scene.interface_of(0).local, NodeAddress::from_octets([10, 0, 0, 1]));
        assert_eq!(scene.interface_of(49).local, NodeAddress::from_octets([10, 0, 0, 50]));
        assert_eq!(scene.interface_of(0).prefix_len, 8);
    }

    #[test]
    fn random_beacons_are_distinct_and_reproducible() {
        let scene = grid_scene();
        let first = scene.select_beacons(12345);
        assert_eq!(first.iter().filter(|b| **b).count(), 6);
        assert_eq!(first, scene.select_beacons(12345));
    }

    #[test]
    fn protocol_defaults_follow_the_grid() {
        let config = grid_scene().protocol_config();
        assert_eq!(config.hello_interval, Duration::from_secs(1));
        assert_eq!(config.max_jitter, Duration::from_millis(10));
        assert_eq!(config.hop_unit_distance, 50.0);
        assert_eq!(config.estimation, EstimationStrategy::NearestTriple);
    }

    #[test]
    fn explicit_scene_with_all_sections_parses() {
        let scene: Scene = serde_json::from_str(
            r#"{
                "layout": { "type": "explicit", "positions": [ {"x": 0, "y": 0}, {"x": 40, "y": 0}, {"x": 0, "y": 40} ] },
                "radio": { "range": 50.0, "loss_probability": 0.1, "shadowing_sigma": 2.0 },
                "network": { "address_base": "192.168.1.0", "prefix_len": 24 },
                "beacons": { "type": "explicit", "node_ids": [0, 2] },
                "protocol": { "hop_unit_distance": 40.0, "estimation": { "type": "averaged-triples", "max_beacons": 5 } },
                "failures": [ { "node_id": 1, "at_ms": 4000 } ]
            }"#,
        )
        .unwrap();
        assert!(validate_scene(&scene).is_ok());
        assert_eq!(scene.select_beacons(0), vec![true, false, true]);
        assert_eq!(scene.interface_of(1).flood_destination(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(
            scene.protocol_config().estimation,
            EstimationStrategy::AveragedTriples { max_beacons: 5 }
        );
        assert_eq!(scene.failures, vec![InterfaceFailure { node_id: 1, at_ms: 4000 }]);
    }

    #[test]
    fn invalid_scenes_are_rejected() {
        let mut scene = grid_scene();
        scene.beacons = BeaconSelection::Explicit { node_ids: vec![3, 3] };
        assert!(validate_scene(&scene).unwrap_err().contains("Duplicate beacon"));

        let mut scene = grid_scene();
        scene.beacons = BeaconSelection::Explicit { node_ids: vec![50] };
        assert!(validate_scene(&scene).is_err());

        let mut scene = grid_scene();
        scene.radio.loss_probability = 1.5;
        assert!(validate_scene(&scene).is_err());

        let mut scene = grid_scene();
        scene.network.address_base = Ipv4Addr::new(255, 255, 255, 200);
        assert!(validate_scene(&scene).is_err());

        let mut scene = grid_scene();
        scene.protocol.estimation = EstimationStrategy::AveragedTriples { max_beacons: 17 };
        assert!(validate_scene(&scene).unwrap_err().contains("max_beacons"));

        let mut scene = grid_scene();
        scene.failures.push(InterfaceFailure { node_id: 99, at_ms: 1 });
        assert!(validate_scene(&scene).unwrap_err().contains("unknown node"));
    }

    #[test]
    fn subnet_broadcast_and_network_addresses_are_rejected() {
        let mut scene = grid_scene();
        scene.layout = Layout::Grid {
            size: 255,
            step: 50.0,
            grid_width: 15,
        };
        scene.network = NetworkParameters {
            address_base: Ipv4Addr::new(192, 168, 1, 0),
            prefix_len: 24,
        };
        assert_eq!(scene.interface_of(254).local.ip(), Ipv4Addr::new(192, 168, 1, 255));
        assert!(validate_scene(&scene).unwrap_err().contains("subnet broadcast"));

        scene.layout = Layout::Grid {
            size: 254,
            step: 50.0,
            grid_width: 15,
        };
        assert!(validate_scene(&scene).is_ok());

        scene.network.address_base = Ipv4Addr::new(192, 168, 0, 255);
        assert_eq!(scene.interface_of(0).local.ip(), Ipv4Addr::new(192, 168, 1, 0));
        assert!(validate_scene(&scene).unwrap_err().contains("network address"));

        // Point-to-point prefixes use every address.
        scene.network.prefix_len = 32;
        assert!(validate_scene(&scene).is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_scene(Path::new("/nonexistent/scene.json")).unwrap_err();
        assert!(matches!(err, SceneLoadError::FileReadError(_)));
    }
}
