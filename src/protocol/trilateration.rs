//! Closed-form 2-D trilateration.
//!
//! Turns three anchor positions and the estimated range to each into a single
//! position fix. The anchors are moved into a local frame where the first sits
//! at the origin and the second on the x axis; the two circle-intersection
//! equations are then solved directly and the result mapped back.
//!
//! Only geometry lives here. Picking which beacons to use and turning hop
//! counts into ranges is the flooding protocol's job.

use serde::{Deserialize, Serialize};

use super::error::EstimationError;
use super::types::Position;

/// Below this (relative to the anchor baseline) the anchors are treated as
/// collinear or coincident.
const DEGENERACY_EPSILON: f64 = 1e-9;

/// Largest anchor pool `AveragedTriples` draws from; the triple count grows
/// cubically with it and an estimate runs on every received packet.
pub const MAX_AVERAGED_BEACONS: usize = 16;

/// How the flooding protocol turns its distance table into a position fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EstimationStrategy {
    /// Trilaterate from the three beacons with the fewest hops.
    #[default]
    NearestTriple,
    /// Average the fixes of every usable triple drawn from the `max_beacons`
    /// beacons with the fewest hops. Degenerate triples are skipped.
    AveragedTriples { max_beacons: usize },
}

impl EstimationStrategy {
    /// Number of lowest-hop anchors the strategy looks at.
    pub fn pool_size(&self) -> usize {
        match self {
            EstimationStrategy::NearestTriple => 3,
            EstimationStrategy::AveragedTriples { max_beacons } => (*max_beacons).clamp(3, MAX_AVERAGED_BEACONS),
        }
    }
}

/// Anchor position together with its estimated range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangedAnchor {
    pub position: Position,
    pub range: f64,
}

/// Solve for the point at distance `r1`, `r2`, `r3` from `p1`, `p2`, `p3`.
///
/// With inconsistent ranges (the circles do not meet in one point) this
/// still returns the point the closed form lands on, which lies on the radical
/// lines of the circle pairs.
///
/// # Errors
///
/// `DegenerateGeometry` if `p1` and `p2` coincide, if the three anchors are
/// collinear, or if any input or the result is not finite.
pub fn trilaterate(p1: Position, p2: Position, p3: Position, r1: f64, r2: f64, r3: f64) -> Result<Position, EstimationError> {
    if !(p1.is_finite() && p2.is_finite() && p3.is_finite() && r1.is_finite() && r2.is_finite() && r3.is_finite()) {
        return Err(EstimationError::DegenerateGeometry);
    }

    let d = p1.distance_to(&p2);
    if d <= DEGENERACY_EPSILON {
        return Err(EstimationError::DegenerateGeometry);
    }
    let ex = ((p2.x - p1.x) / d, (p2.y - p1.y) / d);

    let aux = (p3.x - p1.x, p3.y - p1.y);
    let i = ex.0 * aux.0 + ex.1 * aux.1;

    let ortho = (aux.0 - i * ex.0, aux.1 - i * ex.1);
    let ortho_norm = ortho.0.hypot(ortho.1);
    if ortho_norm <= DEGENERACY_EPSILON * d.max(1.0) {
        return Err(EstimationError::DegenerateGeometry);
    }
    let ey = (ortho.0 / ortho_norm, ortho.1 / ortho_norm);
    let j = ey.0 * aux.0 + ey.1 * aux.1;
    if j.abs() <= DEGENERACY_EPSILON * d.max(1.0) {
        return Err(EstimationError::DegenerateGeometry);
    }

    let x = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
    let y = (r1 * r1 - r3 * r3 + i * i + j * j) / (2.0 * j) - i * x / j;

    let result = Position::new(p1.x + x * ex.0 + y * ey.0, p1.y + x * ex.1 + y * ey.1);
    if !result.is_finite() {
        return Err(EstimationError::DegenerateGeometry);
    }
    Ok(result)
}

/// Estimate a position from anchors already sorted by preference.
///
/// `NearestTriple` uses the first three; `AveragedTriples` averages every
/// non-degenerate triple among the first `max_beacons`, clamped to
/// `3..=MAX_AVERAGED_BEACONS`.
pub fn estimate(anchors: &[RangedAnchor], strategy: EstimationStrategy) -> Result<Position, EstimationError> {
    if anchors.len() < 3 {
        return Err(EstimationError::InsufficientBeacons { have: anchors.len() });
    }

    match strategy {
        EstimationStrategy::NearestTriple => solve_triple(&anchors[0], &anchors[1], &anchors[2]),
        EstimationStrategy::AveragedTriples { .. } => {
            let pool = &anchors[..anchors.len().min(strategy.pool_size())];
            let mut sum = Position::ORIGIN;
            let mut count = 0usize;
            for a in 0..pool.len() {
                for b in a + 1..pool.len() {
                    for c in b + 1..pool.len() {
                        if let Ok(fix) = solve_triple(&pool[a], &pool[b], &pool[c]) {
                            sum.x += fix.x;
                            sum.y += fix.y;
                            count += 1;
                        }
                    }
                }
            }
            if count == 0 {
                return Err(EstimationError::DegenerateGeometry);
            }
            Ok(Position::new(sum.x / count as f64, sum.y / count as f64))
        }
    }
}

fn solve_triple(a: &RangedAnchor, b: &RangedAnchor, c: &RangedAnchor) -> Result<Position, EstimationError> {
    trilaterate(a.position, b.position, c.position, a.range, b.range, c.range)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-6;

    fn anchor(x: f64, y: f64, truth: Position) -> RangedAnchor {
        let position = Position::new(x, y);
        RangedAnchor {
            position,
            range: position.distance_to(&truth),
        }
    }

    fn assert_close(actual: Position, expected: Position) {
        assert!(
            (actual.x - expected.x).abs() < TOLERANCE && (actual.y - expected.y).abs() < TOLERANCE,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn exact_ranges_recover_the_point() {
        let truth = Position::new(30.0, 40.0);
        let p1 = Position::new(0.0, 0.0);
        let p2 = Position::new(100.0, 0.0);
        let p3 = Position::new(0.0, 100.0);
        let fix = trilaterate(p1, p2, p3, p1.distance_to(&truth), p2.distance_to(&truth), p3.distance_to(&truth)).unwrap();
        assert_close(fix, truth);
    }

    #[test]
    fn rotated_and_translated_frame() {
        let truth = Position::new(-12.5, 310.25);
        let p1 = Position::new(250.0, 400.0);
        let p2 = Position::new(150.0, 200.0);
        let p3 = Position::new(350.0, 150.0);
        let fix = trilaterate(p1, p2, p3, p1.distance_to(&truth), p2.distance_to(&truth), p3.distance_to(&truth)).unwrap();
        assert_close(fix, truth);
    }

    #[test]
    fn collinear_anchors_are_degenerate() {
        let result = trilaterate(
            Position::new(0.0, 0.0),
            Position::new(50.0, 0.0),
            Position::new(100.0, 0.0),
            10.0,
            40.0,
            90.0,
        );
        assert_eq!(result, Err(EstimationError::DegenerateGeometry));
    }

    #[test]
    fn nearly_collinear_anchors_are_degenerate() {
        // Threshold scales with the baseline: 1e-9 * 100 m.
        let result = trilaterate(
            Position::new(0.0, 0.0),
            Position::new(100.0, 0.0),
            Position::new(50.0, 1e-8),
            50.0,
            50.0,
            50.0,
        );
        assert_eq!(result, Err(EstimationError::DegenerateGeometry));
    }

    #[test]
    fn slightly_off_line_anchors_still_solve() {
        let truth = Position::new(40.0, 30.0);
        let anchors = [anchor(0.0, 0.0, truth), anchor(100.0, 0.0, truth), anchor(50.0, 1e-5, truth)];
        let fix = estimate(&anchors, EstimationStrategy::NearestTriple).unwrap();
        assert!(fix.is_finite());
        assert!((fix.x - truth.x).abs() < TOLERANCE);
    }

    #[test]
    fn coincident_first_anchors_are_degenerate() {
        let result = trilaterate(
            Position::new(5.0, 5.0),
            Position::new(5.0, 5.0),
            Position::new(0.0, 100.0),
            1.0,
            1.0,
            1.0,
        );
        assert_eq!(result, Err(EstimationError::DegenerateGeometry));
    }

    #[test]
    fn non_finite_range_is_rejected() {
        let result = trilaterate(
            Position::new(0.0, 0.0),
            Position::new(100.0, 0.0),
            Position::new(0.0, 100.0),
            f64::NAN,
            1.0,
            1.0,
        );
        assert_eq!(result, Err(EstimationError::DegenerateGeometry));
    }

    #[test]
    fn fewer_than_three_anchors_is_insufficient() {
        let truth = Position::new(1.0, 1.0);
        let anchors = [anchor(0.0, 0.0, truth), anchor(10.0, 0.0, truth)];
        assert_eq!(
            estimate(&anchors, EstimationStrategy::NearestTriple),
            Err(EstimationError::InsufficientBeacons { have: 2 })
        );
    }

    #[test]
    fn averaged_triples_skip_degenerate_combinations() {
        let truth = Position::new(42.0, 17.0);
        // The first three are collinear; the fourth makes every other triple usable.
        let anchors = [
            anchor(0.0, 0.0, truth),
            anchor(50.0, 0.0, truth),
            anchor(100.0, 0.0, truth),
            anchor(0.0, 100.0, truth),
        ];
        assert_eq!(
            estimate(&anchors, EstimationStrategy::NearestTriple),
            Err(EstimationError::DegenerateGeometry)
        );
        let fix = estimate(&anchors, EstimationStrategy::AveragedTriples { max_beacons: 4 }).unwrap();
        assert_close(fix, truth);
    }

    #[test]
    fn averaged_pool_is_capped() {
        let truth = Position::new(123.0, 77.0);
        let anchors: Vec<RangedAnchor> = (0..40)
            .map(|i| anchor((i % 7) as f64 * 50.0, (i / 7) as f64 * 50.0 + (i % 3) as f64, truth))
            .collect();
        assert_eq!(EstimationStrategy::AveragedTriples { max_beacons: usize::MAX }.pool_size(), MAX_AVERAGED_BEACONS);
        assert_eq!(EstimationStrategy::AveragedTriples { max_beacons: 1 }.pool_size(), 3);
        assert_eq!(
            estimate(&anchors, EstimationStrategy::AveragedTriples { max_beacons: usize::MAX }),
            estimate(&anchors, EstimationStrategy::AveragedTriples { max_beacons: MAX_AVERAGED_BEACONS })
        );
    }
}
