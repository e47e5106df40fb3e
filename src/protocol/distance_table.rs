//! Per-node table of the best known hop distance to every beacon.
//!
//! The table applies the distance-vector rule: a beacon record is only ever
//! overwritten by a strictly shorter path. It therefore converges to the
//! minimum hop count observed per beacon, and duplicated, reordered or
//! longer-path packets are absorbed without effect.

use embassy_time::Instant;
use std::collections::BTreeMap;
use std::fmt;

use super::types::{NodeAddress, Position};

/// What the table knows about one beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeaconRecord {
    pub hop_count: u16,
    pub position: Position,
    pub last_update: Instant,
}

/// Result of offering a candidate path to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First time this beacon was heard.
    Inserted,
    /// A strictly shorter path replaced the stored one.
    Improved { previous_hops: u16 },
    /// The candidate was not shorter; nothing changed.
    Discarded { current_hops: u16 },
}

impl UpdateOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, UpdateOutcome::Discarded { .. })
    }
}

/// Beacon address → best record. Ordered by address so snapshots are stable.
#[derive(Debug, Clone, Default)]
pub struct DistanceTable {
    records: BTreeMap<NodeAddress, BeaconRecord>,
}

impl DistanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored hop count, or `None` if the beacon was never heard.
    pub fn hops_to(&self, beacon: &NodeAddress) -> Option<u16> {
        self.records.get(beacon).map(|r| r.hop_count)
    }

    pub fn position_of(&self, beacon: &NodeAddress) -> Option<Position> {
        self.records.get(beacon).map(|r| r.position)
    }

    pub fn last_updated_at(&self, beacon: &NodeAddress) -> Option<Instant> {
        self.records.get(beacon).map(|r| r.last_update)
    }

    pub fn get(&self, beacon: &NodeAddress) -> Option<&BeaconRecord> {
        self.records.get(beacon)
    }

    /// Known beacons in ascending address order.
    pub fn known_beacons(&self) -> Vec<NodeAddress> {
        self.records.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddress, &BeaconRecord)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offer a path of `candidate_hops` to `beacon`.
    ///
    /// Accepted iff the beacon is unknown or the candidate is strictly
    /// shorter. An equal or longer candidate leaves the record untouched,
    /// including its timestamp.
    pub fn record_update(&mut self, beacon: NodeAddress, candidate_hops: u16, x: f64, y: f64, now: Instant) -> UpdateOutcome {
        let record = BeaconRecord {
            hop_count: candidate_hops,
            position: Position::new(x, y),
            last_update: now,
        };

        match self.records.get_mut(&beacon) {
            None => {
                self.records.insert(beacon, record);
                UpdateOutcome::Inserted
            }
            Some(existing) if candidate_hops < existing.hop_count => {
                let previous_hops = existing.hop_count;
                *existing = record;
                UpdateOutcome::Improved { previous_hops }
            }
            Some(existing) => UpdateOutcome::Discarded {
                current_hops: existing.hop_count,
            },
        }
    }

    /// Up to `k` records with the fewest hops, ties broken by address.
    pub fn nearest(&self, k: usize) -> Vec<(NodeAddress, BeaconRecord)> {
        let mut entries: Vec<(NodeAddress, BeaconRecord)> = self.records.iter().map(|(a, r)| (*a, *r)).collect();
        // BTreeMap iteration is already address-ordered; a stable sort keeps that as tie-break.
        entries.sort_by_key(|(_, r)| r.hop_count);
        entries.truncate(k);
        entries
    }
}

/// Distance-table dump: entry count, then one `addr\thops\t(x,y)\ttime` line per beacon.
impl fmt::Display for DistanceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} entries", self.records.len())?;
        for (beacon, record) in &self.records {
            writeln!(
                f,
                "{}\t{}\t({},{})\t+{}ms",
                beacon,
                record.hop_count,
                record.position.x,
                record.position.y,
                record.last_update.as_millis()
            )?;
        }
        Ok(())
    }
}
