//! Per-group running statistics.

use super::sketch::DistanceSketch;

/// Running statistical state for one group.
///
/// Moments are carried as a count, plain sums and a Welford `M2` term, all of
/// which combine exactly under [`Accumulator::merge`]. Averages are only
/// formed when the group is finalized.
#[derive(Debug, Clone)]
pub struct Accumulator {
    count: u64,
    distance_sum: f64,
    // Welford running mean and sum of squared deviations
    distance_mean: f64,
    distance_m2: f64,
    distance_min: Option<f64>,
    distance_max: Option<f64>,
    amount_sum: f64,
    sketch: DistanceSketch,
}

impl Accumulator {
    pub fn new(sketch_size: usize) -> Self {
        Self {
            count: 0,
            distance_sum: 0.0,
            distance_mean: 0.0,
            distance_m2: 0.0,
            distance_min: None,
            distance_max: None,
            amount_sum: 0.0,
            sketch: DistanceSketch::new(sketch_size),
        }
    }

    pub fn update(&mut self, distance: f64, amount: f64) {
        self.count += 1;

        let delta = distance - self.distance_mean;
        self.distance_mean += delta / self.count as f64;
        self.distance_m2 += delta * (distance - self.distance_mean);
        self.distance_sum += distance;

        self.distance_min = Some(self.distance_min.map_or(distance, |m| m.min(distance)));
        self.distance_max = Some(self.distance_max.map_or(distance, |m| m.max(distance)));

        self.amount_sum += amount;
        self.sketch.insert(distance);
    }

    /// Folds in an accumulator built from a disjoint set of observations.
    ///
    /// Uses the pairwise (Chan et al.) combination for `M2`; counts and sums
    /// add, extremes take the elementwise min/max and the sketches merge
    /// structurally.
    pub fn merge(&mut self, other: Accumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other;
            return;
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.distance_mean - self.distance_mean;

        self.distance_mean += delta * n_b / n;
        self.distance_m2 += other.distance_m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.distance_sum += other.distance_sum;

        self.distance_min = min_opt(self.distance_min, other.distance_min);
        self.distance_max = max_opt(self.distance_max, other.distance_max);

        self.amount_sum += other.amount_sum;
        self.sketch.merge(other.sketch);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn distance_sum(&self) -> f64 {
        self.distance_sum
    }

    /// Sum of squared deviations from the mean.
    pub fn distance_m2(&self) -> f64 {
        self.distance_m2
    }

    pub fn distance_min(&self) -> Option<f64> {
        self.distance_min
    }

    pub fn distance_max(&self) -> Option<f64> {
        self.distance_max
    }

    pub fn amount_sum(&self) -> f64 {
        self.amount_sum
    }

    pub fn sketch_mut(&mut self) -> &mut DistanceSketch {
        &mut self.sketch
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
