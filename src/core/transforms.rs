//! Coordinate projections, normalization and subsampling helpers.
//!
//! These operate on plain coordinate slices and never modify a cloud.

use rand::Rng;
use rayon::prelude::*;

use super::cloud::PointCloudData;

/// Per-axis affine normalization of 2-D points: `(p - mean) / range`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Per-axis mean of the input points.
    pub mean: [f64; 2],
    /// Per-axis extent (`max - min`) of the input points.
    pub range: [f64; 2],
}

impl Normalization {
    /// Computes mean and range of a point set.
    ///
    /// Returns `None` for an empty set or when any axis has zero (or
    /// non-finite) extent, since the normalization would divide by zero.
    pub fn fit(points: &[[f64; 2]]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let (sum, min, max) = points
            .par_iter()
            .fold(
                || ([0.0f64; 2], [f64::INFINITY; 2], [f64::NEG_INFINITY; 2]),
                |(mut sum, mut min, mut max), p| {
                    for axis in 0..2 {
                        sum[axis] += p[axis];
                        min[axis] = min[axis].min(p[axis]);
                        max[axis] = max[axis].max(p[axis]);
                    }
                    (sum, min, max)
                },
            )
            .reduce(
                || ([0.0f64; 2], [f64::INFINITY; 2], [f64::NEG_INFINITY; 2]),
                |a, b| {
                    (
                        [a.0[0] + b.0[0], a.0[1] + b.0[1]],
                        [a.1[0].min(b.1[0]), a.1[1].min(b.1[1])],
                        [a.2[0].max(b.2[0]), a.2[1].max(b.2[1])],
                    )
                },
            );

        let n = points.len() as f64;
        let mean = [sum[0] / n, sum[1] / n];
        let range = [max[0] - min[0], max[1] - min[1]];

        if range.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return None;
        }

        Some(Self { mean, range })
    }

    #[inline]
    pub fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        [
            (p[0] - self.mean[0]) / self.range[0],
            (p[1] - self.mean[1]) / self.range[1],
        ]
    }

    #[inline]
    pub fn invert(&self, p: [f64; 2]) -> [f64; 2] {
        [
            p[0] * self.range[0] + self.mean[0],
            p[1] * self.range[1] + self.mean[1],
        ]
    }
}

/// Projects a cloud onto the XY plane by dropping Z.
pub fn project_xy(cloud: &PointCloudData) -> Vec<[f64; 2]> {
    cloud.xyz().par_iter().map(|p| [p[0], p[1]]).collect()
}

/// Returns a normalized copy of `points` and the transform that maps results back.
pub fn normalize_xy(points: &[[f64; 2]]) -> Option<(Vec<[f64; 2]>, Normalization)> {
    let norm = Normalization::fit(points)?;
    let normalized = points.par_iter().map(|&p| norm.apply(p)).collect();
    Some((normalized, norm))
}

/// Picks at most `max_points` distinct indices out of `0..n` uniformly at random.
///
/// Returns all indices when `n <= max_points`. The draw is without replacement
/// and unbiased; results differ between runs unless `rng` is seeded.
pub fn subsample_indices<R: Rng + ?Sized>(n: usize, max_points: usize, rng: &mut R) -> Vec<usize> {
    if n <= max_points {
        return (0..n).collect();
    }

    let mut indices = rand::seq::index::sample(rng, n, max_points).into_vec();

    // Sort indices for cache-friendly access
    indices.sort_unstable();
    indices
}
