//! Run outputs.
//!
//! - `localization_data.csv`: one row per node and report instant
//! - `dvhop.routes` / `dvhop.distances`: table dumps of every node
//! - `summary.json`: localization error statistics and traffic counters

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::protocol::flooding::ProtocolCounters;

use super::types::{DumpKind, LocalizationRecord, MediumCounters, SimulationEvent};

pub const LOCALIZATION_CSV: &str = "localization_data.csv";
pub const ROUTES_DUMP: &str = "dvhop.routes";
pub const DISTANCES_DUMP: &str = "dvhop.distances";
pub const SUMMARY_JSON: &str = "summary.json";

const CSV_HEADER: &str = "Time,Node,RealX,RealY,EstimatedX,EstimatedY,LocalizationError";

/// One CSV row. Nodes without an estimate leave the last three columns empty.
pub fn csv_row(record: &LocalizationRecord) -> String {
    let time = record.time_ms as f64 / 1000.0;
    match (record.estimated, record.error()) {
        (Some(estimated), Some(error)) => format!(
            "{},{},{},{},{},{},{}",
            time, record.node_id, record.real.x, record.real.y, estimated.x, estimated.y, error
        ),
        _ => format!("{},{},{},{},,,", time, record.node_id, record.real.x, record.real.y),
    }
}

/// Error statistics over the final localization state of the unknown nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizationSummary {
    pub node_count: usize,
    pub beacon_count: usize,
    pub localized_count: usize,
    /// Unknown nodes that never obtained a fix.
    pub unlocalized: Vec<u32>,
    pub mean_error: Option<f64>,
    pub max_error: Option<f64>,
}

impl LocalizationSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a LocalizationRecord>) -> Self {
        let mut summary = LocalizationSummary {
            node_count: 0,
            beacon_count: 0,
            localized_count: 0,
            unlocalized: Vec::new(),
            mean_error: None,
            max_error: None,
        };
        let mut error_sum = 0.0;

        for record in records {
            summary.node_count += 1;
            if record.is_beacon {
                summary.beacon_count += 1;
                continue;
            }
            match record.error() {
                Some(error) => {
                    summary.localized_count += 1;
                    error_sum += error;
                    summary.max_error = Some(summary.max_error.map_or(error, |m| m.max(error)));
                }
                None => summary.unlocalized.push(record.node_id),
            }
        }

        if summary.localized_count > 0 {
            summary.mean_error = Some(error_sum / summary.localized_count as f64);
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scene: String,
    pub seed: u64,
    pub duration_ms: u64,
    pub started_at: String,
    pub finished_at: String,
    pub localization: LocalizationSummary,
    pub protocol: ProtocolCounters,
    pub medium: MediumCounters,
}

/// Collects simulation events on the main thread and writes the output files.
pub struct ReportWriter {
    output_dir: PathBuf,
    csv: BufWriter<File>,
    routes: BTreeMap<u32, String>,
    distances: BTreeMap<u32, String>,
    latest: BTreeMap<u32, LocalizationRecord>,
    protocol: ProtocolCounters,
    started_at: DateTime<Utc>,
}

impl ReportWriter {
    /// Create the output directory and the CSV file with its header.
    pub fn create(output_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(output_dir).with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
        let csv_path = output_dir.join(LOCALIZATION_CSV);
        let file = File::create(&csv_path).with_context(|| format!("Failed to create {}", csv_path.display()))?;
        let mut csv = BufWriter::new(file);
        writeln!(csv, "{}", CSV_HEADER)?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            csv,
            routes: BTreeMap::new(),
            distances: BTreeMap::new(),
            latest: BTreeMap::new(),
            protocol: ProtocolCounters::default(),
            started_at: Utc::now(),
        })
    }

    /// Fold one event in. Returns the medium counters once the run completed.
    pub fn record(&mut self, event: SimulationEvent) -> anyhow::Result<Option<MediumCounters>> {
        match event {
            SimulationEvent::Localization(record) => {
                writeln!(self.csv, "{}", csv_row(&record))?;
                self.latest.insert(record.node_id, record);
            }
            SimulationEvent::Dump { kind, node_id, text } => {
                let dumps = match kind {
                    DumpKind::Routes => &mut self.routes,
                    DumpKind::Distances => &mut self.distances,
                };
                dumps.insert(node_id, text);
            }
            SimulationEvent::Finished { counters, .. } => self.protocol += counters,
            SimulationEvent::Completed(medium) => return Ok(Some(medium)),
        }
        Ok(None)
    }

    /// Flush the CSV, write the dumps and the summary.
    pub fn finish(mut self, scene: &Path, seed: u64, duration_ms: u64, medium: MediumCounters) -> anyhow::Result<RunSummary> {
        self.csv.flush().context("Failed to flush localization log")?;

        for (name, dumps) in [(ROUTES_DUMP, &self.routes), (DISTANCES_DUMP, &self.distances)] {
            if dumps.is_empty() {
                continue;
            }
            let text: String = dumps.values().map(String::as_str).collect();
            let path = self.output_dir.join(name);
            fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        }

        let summary = RunSummary {
            scene: scene.display().to_string(),
            seed,
            duration_ms,
            started_at: self.started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            localization: LocalizationSummary::from_records(self.latest.values()),
            protocol: self.protocol,
            medium,
        };
        let path = self.output_dir.join(SUMMARY_JSON);
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(summary)
    }
}
