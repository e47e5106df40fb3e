//! Run configuration loaded from TOML.
//!
//! The scene says *what* is simulated; this file says *how long* and *where
//! the results go*. It is optional: without one the defaults reproduce the
//! classic 10 s run with dumps at 8 s and 9 s.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::time_driver::{MAX_SPEED_PERCENT, MIN_SPEED_PERCENT};

/// Error type for run configuration failures.
#[derive(Debug)]
pub enum ConfigError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileReadError(msg) => write!(f, "Failed to read config file: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config file: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Timing, seeding and output settings of one simulation run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Total virtual run time.
    pub duration_ms: u64,
    /// Period of the localization CSV snapshots. The final snapshot at the
    /// end of the run is always written.
    pub report_interval_ms: u64,
    /// When every node dumps its routing table (`None` disables the dump).
    pub routes_dump_at_ms: Option<u64>,
    /// When every node dumps its distance table (`None` disables the dump).
    pub distances_dump_at_ms: Option<u64>,
    /// Master seed for beacon selection, jitter and the radio medium.
    pub seed: u64,
    /// Virtual clock speed in percent of wall-clock time.
    pub speed_percent: u32,
    pub output_dir: PathBuf,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            report_interval_ms: 1_000,
            routes_dump_at_ms: Some(8_000),
            distances_dump_at_ms: Some(9_000),
            seed: 12345,
            speed_percent: 1000,
            output_dir: PathBuf::from("output"),
        }
    }
}

impl SimulationConfig {
    /// Load and validate a configuration file.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileReadError(format!("{}: {}", config_path.display(), e)))?;
        let config: SimulationConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate().map_err(ConfigError::ValidationError)?;
        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            log::info!("No run config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        Self::load(config_path)
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &Path) -> PathBuf {
        scene_path.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.duration_ms == 0 {
            return Err("duration-ms must be positive".to_string());
        }
        if self.report_interval_ms == 0 {
            return Err("report-interval-ms must be positive".to_string());
        }
        for (name, at) in [("routes-dump-at-ms", self.routes_dump_at_ms), ("distances-dump-at-ms", self.distances_dump_at_ms)] {
            if let Some(at) = at {
                if at > self.duration_ms {
                    return Err(format!("{} {} is after the end of the run ({} ms)", name, at, self.duration_ms));
                }
            }
        }
        if !(MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT).contains(&self.speed_percent) {
            return Err(format!(
                "speed-percent {} outside {}..={}",
                self.speed_percent, MIN_SPEED_PERCENT, MAX_SPEED_PERCENT
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: SimulationConfig = toml::from_str("duration-ms = 20000\nseed = 7\n").unwrap();
        assert_eq!(config.duration_ms, 20_000);
        assert_eq!(config.seed, 7);
        assert_eq!(config.report_interval_ms, 1_000);
        assert_eq!(config.routes_dump_at_ms, Some(8_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<SimulationConfig>("durration-ms = 1").is_err());
    }

    #[test]
    fn dump_after_end_is_invalid() {
        let config = SimulationConfig {
            duration_ms: 5_000,
            ..SimulationConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("routes-dump-at-ms"));
    }

    #[test]
    fn config_sits_next_to_scene() {
        assert_eq!(
            SimulationConfig::config_path_from_scene(Path::new("scenes/grid50.json")),
            PathBuf::from("scenes/config.toml")
        );
        assert_eq!(SimulationConfig::config_path_from_scene(Path::new("grid50.json")), PathBuf::from("config.toml"));
    }
}
