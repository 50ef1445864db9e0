//! k-nearest-neighbor density estimate at a fixed intrinsic dimension

use anyhow::Result;
use statrs::function::gamma::ln_gamma;

use crate::neighbors::NeighborGraph;

/// Log-density and its error for every point
#[derive(Debug, Clone)]
pub struct DensityEstimate {
    /// Neighborhood size used for every point
    pub k: usize,
    pub log_den: Vec<f64>,
    pub log_den_err: Vec<f64>,
}

/// `ln rho_i = ln k - ln N - ln omega_d - d ln r_{i,k}`, where `omega_d`
/// is the volume of the unit `d`-ball. The error is `1 / sqrt(k)`.
pub fn density_knn(graph: &NeighborGraph, intrinsic_dim: f64, k: usize) -> Result<DensityEstimate> {
    anyhow::ensure!(k >= 1, "kNN density needs k >= 1");
    anyhow::ensure!(
        k <= graph.maxk(),
        "kNN density with k={k} needs at least {k} neighbors per point, graph has {}",
        graph.maxk()
    );
    anyhow::ensure!(
        intrinsic_dim.is_finite() && intrinsic_dim > 0.0,
        "Intrinsic dimension must be positive, got {intrinsic_dim}"
    );

    let n = graph.num_points() as f64;
    let prefactor = (k as f64).ln() - n.ln() - log_unit_ball_volume(intrinsic_dim);
    let log_den = (0..graph.num_points())
        .map(|i| prefactor - intrinsic_dim * graph.distance(i, k).ln())
        .collect();
    let err = 1.0 / (k as f64).sqrt();

    Ok(DensityEstimate {
        k,
        log_den,
        log_den_err: vec![err; graph.num_points()],
    })
}

/// `ln(pi^(d/2) / Gamma(d/2 + 1))`
fn log_unit_ball_volume(d: f64) -> f64 {
    0.5 * d * std::f64::consts::PI.ln() - ln_gamma(0.5 * d + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_ball_volume() {
        // unit disk and unit sphere
        assert!((log_unit_ball_volume(2.0).exp() - std::f64::consts::PI).abs() < 1e-9);
        let sphere = 4.0 / 3.0 * std::f64::consts::PI;
        assert!((log_unit_ball_volume(3.0).exp() - sphere).abs() < 1e-9);
    }

    #[test]
    fn test_denser_points_rank_higher() {
        let points = array![[0.0], [0.1], [0.2], [0.3], [5.0], [7.0]];
        let graph = NeighborGraph::build(points.view(), 3).unwrap();
        let est = density_knn(&graph, 1.0, 2).unwrap();

        assert_eq!(est.log_den.len(), 6);
        assert!(est.log_den[1] > est.log_den[5]);
        assert!(est.log_den[2] > est.log_den[4]);
        assert!((est.log_den_err[0] - 1.0 / 2f64.sqrt()).abs() < 1e-12);

        // 1-d: rho = k / (N * 2 r_k); point 1 has r_2 = 0.1
        let expected = (2.0f64 / (6.0 * 2.0 * 0.1)).ln();
        assert!((est.log_den[1] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_k_larger_than_graph() {
        let points = array![[0.0], [1.0], [2.0]];
        let graph = NeighborGraph::build(points.view(), 1).unwrap();
        assert!(density_knn(&graph, 1.0, 2).is_err());
    }
}
