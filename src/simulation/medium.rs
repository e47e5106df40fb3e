//! Broadcast radio medium.
//!
//! A frame reaches every other node whose distance to the sender is within
//! the radio range. Optionally the range is perturbed per frame and receiver
//! by a zero-mean Gaussian (shadowing), and each surviving delivery is lost
//! with a fixed probability. Reachability is checked on squared distances.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::common::scene::RadioParameters;
use crate::protocol::types::Position;

/// Squared Euclidean distance; range checks compare against range².
pub fn distance2(a: &Position, b: &Position) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

pub struct RadioMedium {
    range: f64,
    loss_probability: f64,
    shadowing: Option<Normal<f64>>,
    rng: StdRng,
}

impl RadioMedium {
    pub fn new(params: &RadioParameters, seed: u64) -> Self {
        // Scene validation rejects negative and non-finite sigmas.
        let shadowing = if params.shadowing_sigma > 0.0 {
            Normal::new(0.0, params.shadowing_sigma).ok()
        } else {
            None
        };
        Self {
            range: params.range,
            loss_probability: params.loss_probability,
            shadowing,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Nominal reachability, without shadowing or loss.
    pub fn in_range(&self, a: &Position, b: &Position) -> bool {
        distance2(a, b) <= self.range * self.range
    }

    /// Outcome of one frame from `sender` to one receiver.
    pub fn deliver(&mut self, sender: &Position, receiver: &Position) -> Delivery {
        let effective_range = match &self.shadowing {
            Some(normal) => (self.range + normal.sample(&mut self.rng)).max(0.0),
            None => self.range,
        };
        if distance2(sender, receiver) > effective_range * effective_range {
            return Delivery::OutOfRange;
        }
        if self.loss_probability > 0.0 && self.rng.gen_bool(self.loss_probability) {
            return Delivery::Lost;
        }
        Delivery::Delivered
    }

    /// Indices of nodes that hear a frame from `sender_index`, plus the number
    /// of deliveries lost on the way.
    pub fn receivers(&mut self, sender_index: usize, positions: &[Position], alive: &[bool]) -> (Vec<usize>, u64) {
        let sender = positions[sender_index];
        let mut receivers = Vec::new();
        let mut lost = 0;
        for (index, position) in positions.iter().enumerate() {
            if index == sender_index || !alive[index] {
                continue;
            }
            match self.deliver(&sender, position) {
                Delivery::Delivered => receivers.push(index),
                Delivery::Lost => lost += 1,
                Delivery::OutOfRange => {}
            }
        }
        (receivers, lost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Lost,
    OutOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(range: f64, loss_probability: f64, shadowing_sigma: f64) -> RadioParameters {
        RadioParameters {
            range,
            loss_probability,
            shadowing_sigma,
        }
    }

    fn line(count: usize, step: f64) -> Vec<Position> {
        (0..count).map(|i| Position::new(i as f64 * step, 0.0)).collect()
    }

    #[test]
    fn squared_distance() {
        assert_eq!(distance2(&Position::new(0.0, 0.0), &Position::new(3.0, 4.0)), 25.0);
    }

    #[test]
    fn ideal_medium_reaches_exactly_the_unit_disk() {
        let mut medium = RadioMedium::new(&params(60.0, 0.0, 0.0), 1);
        let positions = line(4, 50.0);
        let (receivers, lost) = medium.receivers(1, &positions, &[true; 4]);
        assert_eq!(receivers, vec![0, 2]);
        assert_eq!(lost, 0);
        assert!(medium.in_range(&positions[0], &positions[1]));
        assert!(!medium.in_range(&positions[0], &positions[2]));
    }

    #[test]
    fn range_boundary_is_inclusive() {
        let mut medium = RadioMedium::new(&params(50.0, 0.0, 0.0), 1);
        assert_eq!(
            medium.deliver(&Position::new(0.0, 0.0), &Position::new(50.0, 0.0)),
            Delivery::Delivered
        );
    }

    #[test]
    fn dead_nodes_hear_nothing() {
        let mut medium = RadioMedium::new(&params(60.0, 0.0, 0.0), 1);
        let (receivers, _) = medium.receivers(1, &line(3, 50.0), &[true, true, false]);
        assert_eq!(receivers, vec![0]);
    }

    #[test]
    fn certain_loss_drops_every_frame() {
        let mut medium = RadioMedium::new(&params(60.0, 1.0, 0.0), 1);
        let (receivers, lost) = medium.receivers(1, &line(3, 50.0), &[true; 3]);
        assert!(receivers.is_empty());
        assert_eq!(lost, 2);
    }

    #[test]
    fn shadowing_is_reproducible_per_seed() {
        let positions = line(10, 45.0);
        let mut a = RadioMedium::new(&params(50.0, 0.2, 10.0), 99);
        let mut b = RadioMedium::new(&params(50.0, 0.2, 10.0), 99);
        for sender in 0..positions.len() {
            assert_eq!(
                a.receivers(sender, &positions, &[true; 10]),
                b.receivers(sender, &positions, &[true; 10])
            );
        }
    }
}
