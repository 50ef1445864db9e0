//! k-nearest-neighbor graph over one layer's point cloud
//!
//! Row `i` of [`NeighborGraph::distances`] / [`NeighborGraph::indices`]
//! lists point `i` itself at column 0 (distance 0) followed by its `maxk`
//! nearest neighbors in increasing distance. Ranks therefore index columns
//! directly: the k-th neighbor of `i` is `indices[[i, k]]`.

use anyhow::{Context, Result};
use linfa_nn::distance::{Distance, L2Dist};
use linfa_nn::{LinearSearch, NearestNeighbour};
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone)]
pub struct NeighborGraph {
    distances: Array2<f64>,
    indices: Array2<usize>,
}

impl NeighborGraph {
    /// Exact Euclidean kNN graph with `maxk` neighbors per point.
    ///
    /// Points must be pairwise distinct (deduplicate first); `maxk` must
    /// be smaller than the number of points.
    pub fn build(points: ArrayView2<'_, f64>, maxk: usize) -> Result<Self> {
        let n = points.nrows();
        anyhow::ensure!(maxk >= 1, "Neighbor count must be at least 1");
        anyhow::ensure!(
            maxk < n,
            "Requested {maxk} neighbors but only {n} distinct points are available"
        );

        let index = LinearSearch::new()
            .from_batch(&points, L2Dist)
            .context("Failed to build nearest-neighbor index")?;

        let mut distances = Array2::<f64>::zeros((n, maxk + 1));
        let mut indices = Array2::<usize>::zeros((n, maxk + 1));

        for i in 0..n {
            let query = points.row(i);
            let mut found: Vec<(f64, usize)> = index
                .k_nearest(query, maxk + 1)
                .context("Nearest-neighbor query failed")?
                .into_iter()
                .filter(|&(_, j)| j != i)
                .map(|(p, j)| (L2Dist.distance(query, p), j))
                .collect();
            found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            anyhow::ensure!(
                found.len() >= maxk,
                "Point {i}: expected {maxk} neighbors, got {}",
                found.len()
            );

            indices[[i, 0]] = i;
            for (rank, &(d, j)) in found.iter().take(maxk).enumerate() {
                anyhow::ensure!(d > 0.0, "Points {i} and {j} coincide; deduplicate first");
                distances[[i, rank + 1]] = d;
                indices[[i, rank + 1]] = j;
            }
        }

        Ok(Self { distances, indices })
    }

    pub fn num_points(&self) -> usize {
        self.distances.nrows()
    }

    /// Number of neighbors stored per point (excluding the point itself)
    pub fn maxk(&self) -> usize {
        self.distances.ncols() - 1
    }

    /// Distance from `point` to its `rank`-th neighbor (rank 0 is itself)
    pub fn distance(&self, point: usize, rank: usize) -> f64 {
        self.distances[[point, rank]]
    }

    /// Index of the `rank`-th neighbor of `point`
    pub fn neighbor(&self, point: usize, rank: usize) -> usize {
        self.indices[[point, rank]]
    }

    pub fn distances(&self) -> &Array2<f64> {
        &self.distances
    }

    pub fn indices(&self) -> &Array2<usize> {
        &self.indices
    }
}
