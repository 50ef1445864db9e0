//! Per-layer clustering unit
//!
//! One layer slice goes through: exact-duplicate removal, Gride intrinsic
//! dimension, kNN density, ADP clustering, and agreement metrics against
//! either ground-truth labels ([`process_layer`]) or a second, independently
//! clustered tensor ([`process_layer_pair`]).

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adp::{cluster_adp, AdpClustering};
use crate::density::density_knn;
use crate::hidden_states::HiddenStates;
use crate::intrinsic_dim::{id_scaling_gride, select_scale};
use crate::metrics::{ComparisonMetric, Contingency};
use crate::neighbors::NeighborGraph;

/// Parameters of the per-layer clustering pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Largest neighbor rank used by the Gride scaling
    pub id_range_max: usize,
    /// Which Gride scale fixes the working dimension (3 -> ranks 8/16)
    pub id_scale_index: usize,
    /// Neighborhood size of the kNN density
    pub density_k: usize,
    /// Leave low-density boundary points unassigned
    pub halo: bool,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            id_range_max: 100,
            id_scale_index: 3,
            density_k: 16,
            halo: false,
        }
    }
}

/// Clustering of one deduplicated layer slice
#[derive(Debug, Clone)]
pub struct LayerClustering {
    /// Original instance indices kept after deduplication, ascending
    pub kept: Vec<usize>,
    /// Working intrinsic dimension
    pub intrinsic_dim: f64,
    pub adp: AdpClustering,
}

/// Result of clustering one layer against ground-truth labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerResult {
    pub layer: usize,
    /// Cluster x label counts (rows: ascending cluster id, columns: label code)
    pub bincount: Vec<Vec<u64>>,
    pub metrics: BTreeMap<ComparisonMetric, f64>,
    pub clusters_assignment: Vec<i32>,
    /// Labels restricted to the kept instances
    pub labels: Vec<i32>,
}

/// Result of comparing two clusterings of one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLayerResult {
    pub layer: usize,
    pub metrics: BTreeMap<ComparisonMetric, f64>,
}

/// Indices of the first occurrence of every distinct row, ascending.
///
/// `-0.0` and `0.0` are treated as equal.
pub fn unique_row_indices(rows: ArrayView2<'_, f32>) -> Vec<usize> {
    let mut seen: HashMap<Vec<u32>, usize> = HashMap::with_capacity(rows.nrows());
    let mut kept = Vec::with_capacity(rows.nrows());
    for (i, row) in rows.outer_iter().enumerate() {
        let key: Vec<u32> = row
            .iter()
            .map(|&x| if x == 0.0 { 0 } else { x.to_bits() })
            .collect();
        seen.entry(key).or_insert_with(|| {
            kept.push(i);
            i
        });
    }
    kept
}

/// Deduplicate and cluster one layer slice at significance `z`
pub fn cluster_layer(
    rows: ArrayView2<'_, f32>,
    z: f64,
    config: &ClusteringConfig,
) -> Result<LayerClustering> {
    let kept = unique_row_indices(rows);
    let n = kept.len();
    anyhow::ensure!(n >= 3, "Only {n} distinct points, too few to cluster");

    let mut points = Array2::<f64>::zeros((n, rows.ncols()));
    for (dst, &src) in kept.iter().enumerate() {
        points.row_mut(dst).assign(&rows.row(src).mapv(f64::from));
    }

    let maxk = config.id_range_max.max(config.density_k).min(n - 1);
    let graph = NeighborGraph::build(points.view(), maxk)?;

    let scales = id_scaling_gride(&graph, config.id_range_max)?;
    let working = select_scale(&scales, config.id_scale_index)?;
    let density = density_knn(&graph, working.id, config.density_k)?;
    let adp = cluster_adp(&graph, &density, z, config.halo)?;

    debug!(
        "{} distinct points, id={:.2} (ranks {}/{}), {} clusters, {} halo",
        n,
        working.id,
        working.n1,
        working.n2,
        adp.num_clusters(),
        adp.num_halo()
    );

    Ok(LayerClustering {
        kept,
        intrinsic_dim: working.id,
        adp,
    })
}

/// Cluster `layer` of `hidden_states` and score it against `labels`.
///
/// `labels` is aligned with the instance axis before deduplication and is
/// restricted with the same kept indices as the representations.
pub fn process_layer(
    layer: usize,
    hidden_states: &HiddenStates,
    labels: &[i32],
    z: f64,
    config: &ClusteringConfig,
) -> Result<LayerResult> {
    anyhow::ensure!(
        labels.len() == hidden_states.num_instances(),
        "Label length {} does not match the number of instances {}",
        labels.len(),
        hidden_states.num_instances()
    );
    let rows = hidden_states.layer(layer)?;
    let clustering =
        cluster_layer(rows, z, config).with_context(|| format!("Clustering layer {layer}"))?;

    let subjects: Vec<i32> = clustering.kept.iter().map(|&i| labels[i]).collect();
    let assignment = clustering.adp.assignment;

    let mut metrics = BTreeMap::new();
    for metric in ComparisonMetric::ALL {
        metrics.insert(metric, metric.compute(&assignment, &subjects)?);
    }

    Ok(LayerResult {
        layer,
        bincount: bincount(&assignment, &subjects)?,
        metrics,
        clusters_assignment: assignment,
        labels: subjects,
    })
}

/// Cluster `layer` of both tensors independently and compare the two
/// assignments. Both sides must keep the same number of distinct points.
pub fn process_layer_pair(
    layer: usize,
    first: &HiddenStates,
    second: &HiddenStates,
    z: f64,
    config: &ClusteringConfig,
) -> Result<PairLayerResult> {
    anyhow::ensure!(
        first.num_instances() == second.num_instances(),
        "Layer {layer}: runs have {} and {} instances",
        first.num_instances(),
        second.num_instances()
    );
    let first_clusters = cluster_layer(first.layer(layer)?, z, config)
        .with_context(|| format!("Clustering layer {layer} of the first run"))?;
    let second_clusters = cluster_layer(second.layer(layer)?, z, config)
        .with_context(|| format!("Clustering layer {layer} of the second run"))?;

    let (a, b) = (
        &first_clusters.adp.assignment,
        &second_clusters.adp.assignment,
    );
    anyhow::ensure!(
        a.len() == b.len(),
        "Layer {layer}: runs keep {} and {} distinct instances",
        a.len(),
        b.len()
    );

    let mut metrics = BTreeMap::new();
    for metric in ComparisonMetric::ALL {
        metrics.insert(metric, metric.compute(a, b)?);
    }
    Ok(PairLayerResult { layer, metrics })
}

/// Cluster x label count matrix; columns cover label codes `0..=max`
fn bincount(assignment: &[i32], labels: &[i32]) -> Result<Vec<Vec<u64>>> {
    anyhow::ensure!(
        labels.iter().all(|&l| l >= 0),
        "Label codes must be non-negative"
    );
    let n_labels = labels.iter().max().map_or(0, |&m| m as usize + 1);
    let table = Contingency::new(assignment, labels)?;
    let mut out = vec![vec![0u64; n_labels]; table.row_values.len()];
    for ((r, c), &count) in table.counts.indexed_iter() {
        out[r][table.col_values[c] as usize] = count;
    }
    Ok(out)
}
