//! Advanced Density Peaks (ADP) clustering
//!
//! 1. Putative centers: points whose `g = log_den - log_den_err` is not
//!    exceeded within their `k` neighbors and which do not sit inside the
//!    `k`-neighborhood of a point with higher `g`.
//! 2. Remaining points, in decreasing `g`, join the cluster of their
//!    nearest already-assigned neighbor.
//! 3. A point `i` of cluster `c` is a border point towards `c'` when one of
//!    its `k` neighbors `j` lies in `c'` and `i` is the closest member of
//!    `c` to `j`. The saddle density between two clusters is the highest
//!    border density found.
//! 4. Clusters `a`, `b` are merged when, for either peak,
//!    `log_den_peak - log_den_saddle < Z (err_peak + err_saddle)`. The
//!    qualifying pair with the highest saddle merges first; saddles of the
//!    absorbed cluster are inherited by the survivor.
//! 5. Optionally, points below the highest saddle of their cluster become
//!    [`HALO`].

use anyhow::Result;
use ndarray::Array2;
use tracing::debug;

use crate::density::DensityEstimate;
use crate::neighbors::NeighborGraph;

/// Cluster id given to halo points
pub const HALO: i32 = -1;

#[derive(Debug, Clone)]
pub struct AdpClustering {
    /// Final cluster id per point (`HALO` for halo points)
    pub assignment: Vec<i32>,
    /// Point index of each final cluster's density peak
    pub centers: Vec<usize>,
    /// Highest saddle log-density of each final cluster (`-inf` if isolated)
    pub max_border: Vec<f64>,
}

impl AdpClustering {
    pub fn num_clusters(&self) -> usize {
        self.centers.len()
    }

    pub fn num_halo(&self) -> usize {
        self.assignment.iter().filter(|&&c| c == HALO).count()
    }
}

/// Run ADP at significance `z` on a precomputed neighbor graph and density
pub fn cluster_adp(
    graph: &NeighborGraph,
    density: &DensityEstimate,
    z: f64,
    halo: bool,
) -> Result<AdpClustering> {
    let n = graph.num_points();
    let k = density.k;
    anyhow::ensure!(
        density.log_den.len() == n && density.log_den_err.len() == n,
        "Density has {} entries for {n} points",
        density.log_den.len()
    );
    anyhow::ensure!(k <= graph.maxk(), "Density neighborhood exceeds neighbor graph");
    anyhow::ensure!(z.is_finite() && z >= 0.0, "Significance must be non-negative, got {z}");
    anyhow::ensure!(
        density.log_den.iter().all(|v| v.is_finite()),
        "Non-finite log-density"
    );

    let log_den = &density.log_den;
    let err = &density.log_den_err;
    let g: Vec<f64> = log_den.iter().zip(err).map(|(d, e)| d - e).collect();

    // --- Centers ---------------------------------------------------------
    let mut dominator: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        for r in 1..=k {
            let j = graph.neighbor(i, r);
            if g[j] > g[i] && dominator[i].is_none() {
                dominator[i] = Some(j);
            }
            if g[i] > g[j] && dominator[j].is_none() {
                dominator[j] = Some(i);
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| g[b].total_cmp(&g[a]).then(a.cmp(&b)));

    let centers: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| dominator[i].is_none())
        .collect();
    let n_init = centers.len();

    // --- Assignment ------------------------------------------------------
    let mut cluster: Vec<Option<usize>> = vec![None; n];
    for (c, &center) in centers.iter().enumerate() {
        cluster[center] = Some(c);
    }
    for &i in &order {
        if cluster[i].is_some() {
            continue;
        }
        let nearest = (1..=graph.maxk())
            .map(|r| graph.neighbor(i, r))
            .find_map(|j| cluster[j]);
        cluster[i] = match nearest {
            Some(c) => Some(c),
            // The dominating point is denser, so it was assigned earlier
            None => dominator[i].and_then(|d| cluster[d]),
        };
        anyhow::ensure!(cluster[i].is_some(), "Point {i} could not be assigned");
    }
    let cluster: Vec<usize> = cluster.into_iter().flatten().collect();

    // --- Borders ---------------------------------------------------------
    let mut border = Array2::<f64>::from_elem((n_init, n_init), f64::NEG_INFINITY);
    let mut border_err = Array2::<f64>::zeros((n_init, n_init));
    for i in 0..n {
        let c = cluster[i];
        for r in 1..=k {
            let j = graph.neighbor(i, r);
            let cj = cluster[j];
            if cj == c {
                continue;
            }
            let closest_in_c = (1..=graph.maxk())
                .map(|rr| graph.neighbor(j, rr))
                .find(|&m| cluster[m] == c);
            if closest_in_c == Some(i) && log_den[i] > border[[c, cj]] {
                border[[c, cj]] = log_den[i];
                border[[cj, c]] = log_den[i];
                border_err[[c, cj]] = err[i];
                border_err[[cj, c]] = err[i];
            }
        }
    }

    // --- Merging ---------------------------------------------------------
    let peak_den: Vec<f64> = centers.iter().map(|&p| log_den[p]).collect();
    let peak_err: Vec<f64> = centers.iter().map(|&p| err[p]).collect();
    let mut alive = vec![true; n_init];
    let mut merged_into: Vec<usize> = (0..n_init).collect();

    loop {
        let mut best: Option<(usize, usize)> = None;
        let mut best_saddle = f64::NEG_INFINITY;
        for a in (0..n_init).filter(|&a| alive[a]) {
            for b in ((a + 1)..n_init).filter(|&b| alive[b]) {
                let saddle = border[[a, b]];
                if saddle == f64::NEG_INFINITY || saddle <= best_saddle {
                    continue;
                }
                let e = border_err[[a, b]];
                let a_shallow = peak_den[a] - saddle < z * (peak_err[a] + e);
                let b_shallow = peak_den[b] - saddle < z * (peak_err[b] + e);
                if a_shallow || b_shallow {
                    best = Some((a, b));
                    best_saddle = saddle;
                }
            }
        }

        let Some((a, b)) = best else { break };
        let (keep, gone) = if peak_den[a] >= peak_den[b] { (a, b) } else { (b, a) };
        alive[gone] = false;
        merged_into[gone] = keep;
        for o in 0..n_init {
            if o != keep && o != gone && alive[o] && border[[gone, o]] > border[[keep, o]] {
                border[[keep, o]] = border[[gone, o]];
                border[[o, keep]] = border[[gone, o]];
                border_err[[keep, o]] = border_err[[gone, o]];
                border_err[[o, keep]] = border_err[[gone, o]];
            }
        }
        for o in 0..n_init {
            border[[gone, o]] = f64::NEG_INFINITY;
            border[[o, gone]] = f64::NEG_INFINITY;
        }
    }

    // --- Relabel ---------------------------------------------------------
    let root = |mut c: usize| {
        while merged_into[c] != c {
            c = merged_into[c];
        }
        c
    };
    let survivors: Vec<usize> = (0..n_init).filter(|&c| alive[c]).collect();
    let mut final_id = vec![0usize; n_init];
    for (id, &c) in survivors.iter().enumerate() {
        final_id[c] = id;
    }

    let max_border: Vec<f64> = survivors
        .iter()
        .map(|&c| {
            survivors
                .iter()
                .filter(|&&o| o != c)
                .map(|&o| border[[c, o]])
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect();

    let assignment: Vec<i32> = (0..n)
        .map(|i| {
            let id = final_id[root(cluster[i])];
            if halo && log_den[i] < max_border[id] {
                HALO
            } else {
                id as i32
            }
        })
        .collect();

    debug!(
        "ADP: {} putative centers, {} clusters after merging at Z={z}",
        n_init,
        survivors.len()
    );

    Ok(AdpClustering {
        assignment,
        centers: survivors.iter().map(|&c| centers[c]).collect(),
        max_border,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::density_knn;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn blobs(centers: &[(f64, f64)], per_blob: usize, sigma: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Array2::<f64>::zeros((centers.len() * per_blob, 2));
        for (b, &(cx, cy)) in centers.iter().enumerate() {
            for p in 0..per_blob {
                let u1: f64 = rng.gen_range(1e-12..1.0);
                let u2: f64 = rng.gen();
                let r = (-2.0 * u1.ln()).sqrt() * sigma;
                let theta = 2.0 * std::f64::consts::PI * u2;
                points[[b * per_blob + p, 0]] = cx + r * theta.cos();
                points[[b * per_blob + p, 1]] = cy + r * theta.sin();
            }
        }
        points
    }

    fn run(points: &Array2<f64>, k: usize, z: f64, halo: bool) -> (AdpClustering, DensityEstimate) {
        let graph = NeighborGraph::build(points.view(), 2 * k).unwrap();
        let density = density_knn(&graph, 2.0, k).unwrap();
        (cluster_adp(&graph, &density, z, halo).unwrap(), density)
    }

    #[test]
    fn test_separated_blobs_stay_apart() {
        let points = blobs(&[(0.0, 0.0), (20.0, 0.0)], 60, 0.5, 1);
        let (result, _) = run(&points, 10, 1.65, false);

        assert!(result.num_clusters() >= 2);
        assert_eq!(result.num_halo(), 0);
        for i in 0..60 {
            for j in 60..120 {
                assert_ne!(result.assignment[i], result.assignment[j]);
            }
        }
    }

    #[test]
    fn test_large_significance_merges_each_blob() {
        let points = blobs(&[(0.0, 0.0), (20.0, 0.0)], 60, 0.5, 2);
        let (result, _) = run(&points, 10, 1e6, false);

        assert_eq!(result.num_clusters(), 2);
        let first = result.assignment[0];
        let second = result.assignment[60];
        assert_ne!(first, second);
        assert!(result.assignment[..60].iter().all(|&c| c == first));
        assert!(result.assignment[60..].iter().all(|&c| c == second));
    }

    #[test]
    fn test_cluster_ids_are_dense() {
        let points = blobs(&[(0.0, 0.0), (6.0, 0.0), (0.0, 6.0)], 50, 1.0, 3);
        let (result, _) = run(&points, 8, 0.5, false);
        let max_id = *result.assignment.iter().max().unwrap();
        assert_eq!(max_id as usize + 1, result.num_clusters());
        assert!(result.assignment.iter().all(|&c| c >= 0));
        for (id, &center) in result.centers.iter().enumerate() {
            assert_eq!(result.assignment[center], id as i32);
        }
    }

    #[test]
    fn test_halo_marks_points_below_saddle() {
        let points = blobs(&[(0.0, 0.0), (3.5, 0.0)], 150, 1.0, 4);
        let (plain, density) = run(&points, 10, 1.0, false);
        let (with_halo, _) = run(&points, 10, 1.0, true);

        assert_eq!(plain.num_clusters(), with_halo.num_clusters());
        for i in 0..points.nrows() {
            let c = plain.assignment[i] as usize;
            if density.log_den[i] < plain.max_border[c] {
                assert_eq!(with_halo.assignment[i], HALO);
            } else {
                assert_eq!(with_halo.assignment[i], plain.assignment[i]);
            }
        }
        if plain.max_border.iter().any(|b| b.is_finite()) {
            assert!(with_halo.num_halo() > 0);
        }
    }

    #[test]
    fn test_rejects_negative_significance() {
        let points = blobs(&[(0.0, 0.0)], 30, 1.0, 5);
        let graph = NeighborGraph::build(points.view(), 10).unwrap();
        let density = density_knn(&graph, 2.0, 5).unwrap();
        assert!(cluster_adp(&graph, &density, -1.0, false).is_err());
    }
}
