//! Layer-parallel orchestration
//!
//! Runs the per-layer unit over layers `1..n_layers` (layer 0 is the
//! embedding output and is always skipped) and transposes the per-layer
//! results into per-metric lists. List position `layer - 1` holds layer
//! `layer` in both sequential and parallel mode.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hidden_states::HiddenStates;
use crate::labels::LabelEncoding;
use crate::layer::{
    process_layer, process_layer_pair, ClusteringConfig, LayerResult, PairLayerResult,
};
use crate::metrics::ComparisonMetric;

/// Sequential or pooled execution of one task per layer
#[derive(Debug, Clone)]
pub struct LayerExecutor {
    parallel: bool,
    num_workers: usize,
}

impl LayerExecutor {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            num_workers: 1,
        }
    }

    pub fn parallel(num_workers: usize) -> Self {
        Self {
            parallel: true,
            num_workers: num_workers.max(1),
        }
    }

    pub fn new(parallel: bool, num_workers: usize) -> Self {
        if parallel {
            Self::parallel(num_workers)
        } else {
            Self::sequential()
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Run `task` for every layer in `1..num_layers`, results in layer order.
    ///
    /// The first failing layer aborts the call.
    pub fn map_layers<T, F>(&self, num_layers: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        if !self.parallel {
            return (1..num_layers).map(task).collect();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_workers)
            .build()
            .context("Failed to build layer worker pool")?;
        debug!(
            "Dispatching {} layers to {} workers",
            num_layers.saturating_sub(1),
            self.num_workers
        );
        pool.install(|| (1..num_layers).into_par_iter().map(&task).collect())
    }
}

impl Default for LayerExecutor {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::parallel(workers)
    }
}

/// Per-layer clustering against labels, merged column-wise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerwiseClustering {
    pub bincount: Vec<Vec<Vec<u64>>>,
    pub metrics: BTreeMap<ComparisonMetric, Vec<f64>>,
    pub clusters_assignment: Vec<Vec<i32>>,
    pub labels: Vec<Vec<i32>>,
}

impl LayerwiseClustering {
    fn merge(results: Vec<LayerResult>) -> Self {
        let mut out = Self::default();
        for result in results {
            out.bincount.push(result.bincount);
            for (metric, value) in result.metrics {
                out.metrics.entry(metric).or_default().push(value);
            }
            out.clusters_assignment.push(result.clusters_assignment);
            out.labels.push(result.labels);
        }
        out
    }

    /// Per-layer values of one metric (empty if the metric was not computed)
    pub fn metric(&self, metric: ComparisonMetric) -> &[f64] {
        self.metrics.get(&metric).map_or(&[], Vec::as_slice)
    }

    pub fn num_layers(&self) -> usize {
        self.clusters_assignment.len()
    }
}

/// Per-layer comparison of two clusterings, merged column-wise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerwiseComparison {
    pub metrics: BTreeMap<ComparisonMetric, Vec<f64>>,
}

impl LayerwiseComparison {
    fn merge(results: Vec<PairLayerResult>) -> Self {
        let mut metrics: BTreeMap<ComparisonMetric, Vec<f64>> = BTreeMap::new();
        for result in results {
            for (metric, value) in result.metrics {
                metrics.entry(metric).or_default().push(value);
            }
        }
        Self { metrics }
    }

    pub fn metric(&self, metric: ComparisonMetric) -> &[f64] {
        self.metrics.get(&metric).map_or(&[], Vec::as_slice)
    }
}

/// Cluster every layer (except 0) and score it against `labels`
pub fn parallel_compute(
    executor: &LayerExecutor,
    hidden_states: &HiddenStates,
    labels: &LabelEncoding,
    z: f64,
    config: &ClusteringConfig,
) -> Result<LayerwiseClustering> {
    anyhow::ensure!(
        hidden_states.num_instances() == labels.len(),
        "Label length {} does not match the number of instances {}",
        labels.len(),
        hidden_states.num_instances()
    );
    let results = executor.map_layers(hidden_states.num_layers(), |layer| {
        process_layer(layer, hidden_states, &labels.labels, z, config)
    })?;
    Ok(LayerwiseClustering::merge(results))
}

/// Cluster every layer (except 0) of both runs and compare them
pub fn parallel_compute_pair(
    executor: &LayerExecutor,
    first: &HiddenStates,
    second: &HiddenStates,
    z: f64,
    config: &ClusteringConfig,
) -> Result<LayerwiseComparison> {
    anyhow::ensure!(
        first.num_layers() == second.num_layers(),
        "The two runs must have the same number of layers ({} vs {})",
        first.num_layers(),
        second.num_layers()
    );
    let results = executor.map_layers(first.num_layers(), |layer| {
        process_layer_pair(layer, first, second, z, config)
    })?;
    Ok(LayerwiseComparison::merge(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hidden_states::{InstanceRecord, MetaField};
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn random_states(n: usize, layers: usize, dim: usize, seed: u64) -> HiddenStates {
        let mut rng = StdRng::seed_from_u64(seed);
        let tensor = Array3::from_shape_fn((n, layers, dim), |(i, _, _)| {
            (i % 3) as f32 * 5.0 + rng.gen::<f32>()
        });
        let letters = ["A", "B", "C"];
        let records = (0..n)
            .map(|i| InstanceRecord::new("mmlu:anatomy", letters[i % 3]))
            .collect();
        HiddenStates::new(tensor, records).unwrap()
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            id_range_max: 16,
            id_scale_index: 2,
            density_k: 8,
            halo: false,
        }
    }

    #[test]
    fn test_map_layers_preserves_order() {
        let executor = LayerExecutor::parallel(4);
        let out = executor
            .map_layers(8, |layer| {
                // later layers finish first
                std::thread::sleep(Duration::from_millis(((8 - layer) * 5) as u64));
                Ok(layer)
            })
            .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_map_layers_propagates_error() {
        let executor = LayerExecutor::parallel(2);
        let out: Result<Vec<usize>> = executor.map_layers(5, |layer| {
            anyhow::ensure!(layer != 3, "layer 3 failed");
            Ok(layer)
        });
        assert!(out.is_err());
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let hs = random_states(60, 5, 6, 9);
        let labels = LabelEncoding::from_field(&hs, MetaField::LetterGold).unwrap();

        let seq = parallel_compute(&LayerExecutor::sequential(), &hs, &labels, 1.6, &config())
            .unwrap();
        let par = parallel_compute(&LayerExecutor::parallel(3), &hs, &labels, 1.6, &config())
            .unwrap();

        assert_eq!(seq.num_layers(), 4);
        for metric in ComparisonMetric::ALL {
            assert_eq!(seq.metric(metric).len(), 4);
            assert_eq!(seq.metric(metric), par.metric(metric));
        }
        assert_eq!(seq.clusters_assignment, par.clusters_assignment);
        assert_eq!(seq.labels, par.labels);
    }

    #[test]
    fn test_pair_requires_same_layer_count() {
        let a = random_states(30, 5, 4, 1);
        let b = random_states(30, 4, 4, 2);
        let err = parallel_compute_pair(&LayerExecutor::sequential(), &a, &b, 1.6, &config())
            .unwrap_err();
        assert!(err.to_string().contains("same number of layers"));
    }

    #[test]
    fn test_pair_lists_have_one_entry_per_layer() {
        let a = random_states(40, 6, 4, 3);
        let b = random_states(40, 6, 4, 4);
        let out = parallel_compute_pair(&LayerExecutor::parallel(2), &a, &b, 1.6, &config())
            .unwrap();
        for metric in ComparisonMetric::ALL {
            assert_eq!(out.metric(metric).len(), 5);
        }
    }
}
