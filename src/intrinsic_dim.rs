//! Gride intrinsic-dimension estimation across neighborhood scales
//!
//! For neighbor ranks `n1 < n2 = 2 n1`, the ratio `mu = r_{n2} / r_{n1}`
//! of a point in a locally uniform `d`-dimensional cloud has density
//!
//! ```text
//! f(mu) = d (mu^d - 1)^(n2 - n1 - 1) / (B(n2 - n1, n1) mu^(d (n2 - 1) + 1))
//! ```
//!
//! The estimate is the maximizer of the summed log-likelihood over all
//! points. The log-likelihood is concave in `d`, so the maximizer is the
//! root of its derivative, found by bisection on `[D_MIN, D_MAX]`.
//! Doubling `n1` probes the cloud at increasing length scales.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::neighbors::NeighborGraph;

const D_MIN: f64 = 1e-3;
const D_MAX: f64 = 1e3;
const TOLERANCE: f64 = 1e-7;

/// Dimension estimate at one neighborhood scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleEstimate {
    pub n1: usize,
    pub n2: usize,
    /// Estimated intrinsic dimension
    pub id: f64,
    /// Mean distance to the `n2`-th neighbor
    pub scale: f64,
}

/// Gride estimates for `n1 = 1, 2, 4, ...` while `2 n1 <= min(maxk, range_max)`
pub fn id_scaling_gride(graph: &NeighborGraph, range_max: usize) -> Result<Vec<ScaleEstimate>> {
    let max_rank = graph.maxk().min(range_max);
    anyhow::ensure!(
        max_rank >= 2,
        "Gride needs at least 2 neighbors per point, have {max_rank}"
    );

    let mut estimates = Vec::new();
    let mut n1 = 1;
    while 2 * n1 <= max_rank {
        let n2 = 2 * n1;
        let log_mus = log_ratios(graph, n1, n2);
        let id = gride_mle(&log_mus, n1, n2);
        let scale = (0..graph.num_points())
            .map(|i| graph.distance(i, n2))
            .sum::<f64>()
            / graph.num_points() as f64;
        estimates.push(ScaleEstimate { n1, n2, id, scale });
        n1 *= 2;
    }
    Ok(estimates)
}

/// Pick the estimate at `scale_index`. Fails when the point cloud is too
/// small to reach that scale.
pub fn select_scale(estimates: &[ScaleEstimate], scale_index: usize) -> Result<ScaleEstimate> {
    estimates.get(scale_index).copied().ok_or_else(|| {
        anyhow::anyhow!(
            "Scale index {scale_index} requested but only {} Gride scales are available",
            estimates.len()
        )
    })
}

fn log_ratios(graph: &NeighborGraph, n1: usize, n2: usize) -> Vec<f64> {
    (0..graph.num_points())
        .map(|i| (graph.distance(i, n2) / graph.distance(i, n1)).ln())
        .collect()
}

/// Maximum-likelihood dimension for the given `ln mu` values
fn gride_mle(log_mus: &[f64], n1: usize, n2: usize) -> f64 {
    let derivative = |d: f64| score(log_mus, d, n1, n2);

    if derivative(D_MIN) <= 0.0 {
        return D_MIN;
    }
    if derivative(D_MAX) >= 0.0 {
        return D_MAX;
    }

    let (mut lo, mut hi) = (D_MIN, D_MAX);
    while hi - lo > TOLERANCE * lo.max(1.0) {
        let mid = 0.5 * (lo + hi);
        if derivative(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Derivative of the Gride log-likelihood with respect to `d`
fn score(log_mus: &[f64], d: f64, n1: usize, n2: usize) -> f64 {
    let n = log_mus.len() as f64;
    let k = (n2 - n1 - 1) as f64;
    let mut sum_log = 0.0;
    let mut sum_ratio = 0.0;
    for &lm in log_mus {
        sum_log += lm;
        // mu^d ln(mu) / (mu^d - 1), which tends to 1/d as mu -> 1
        let x = d * lm;
        sum_ratio += if x < 1e-12 {
            1.0 / d
        } else {
            lm / (-(-x).exp_m1())
        };
    }
    n / d + k * sum_ratio - (n2 as f64 - 1.0) * sum_log
}
