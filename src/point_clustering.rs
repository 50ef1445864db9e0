//! Clustering agreement between two runs
//!
//! Compares how two models (or one model under two prompt configurations)
//! partition the same instances, layer by layer. Model names are paired
//! as base/chat variants; every pair is evaluated under a few shot-count
//! combinations.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::layer::ClusteringConfig;
use crate::metrics::ComparisonMetric;
use crate::orchestrator::{parallel_compute_pair, LayerExecutor, LayerwiseComparison};
use crate::query::{Method, TensorQuery};
use crate::storage::TensorStorage;
use crate::table::{PointClusteringRow, ResultTable};

/// Pair every base model with itself, its chat variant with itself, and
/// the base with the chat variant.
///
/// Names containing `chat` are chat variants. Both groups are sorted and
/// matched by position; an unmatched tail is dropped.
pub fn pair_names(names: &[String]) -> Vec<(String, String)> {
    let (mut chat, mut base): (Vec<&String>, Vec<&String>) =
        names.iter().partition(|n| n.contains("chat"));
    base.sort();
    chat.sort();

    let mut pairs = Vec::with_capacity(3 * base.len().min(chat.len()));
    for (b, c) in base.into_iter().zip(chat) {
        pairs.push((b.clone(), b.clone()));
        pairs.push((c.clone(), c.clone()));
        pairs.push((b.clone(), c.clone()));
    }
    pairs
}

/// Excludes models whose name contains any of the given substrings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFilter {
    exclude: Vec<String>,
}

impl ModelFilter {
    pub fn new(exclude: Vec<String>) -> Self {
        Self { exclude }
    }

    /// Filter that excludes nothing
    pub fn allow_all() -> Self {
        Self { exclude: vec![] }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|s| name.contains(s.as_str()))
    }

    /// Whether a pair survives: neither side may be excluded
    pub fn allows(&self, pair: &(String, String)) -> bool {
        !self.is_excluded(&pair.0) && !self.is_excluded(&pair.1)
    }
}

impl Default for ModelFilter {
    fn default() -> Self {
        Self::new(vec!["13".to_string()])
    }
}

#[derive(Debug, Clone)]
pub struct PointClusteringConfig {
    pub significances: Vec<f64>,
    pub method: Method,
    /// Dataset selector for both sides
    pub dataset: String,
    /// Zero-shot count
    pub base_shots: u32,
    /// Few-shot count
    pub few_shots: u32,
    pub filter: ModelFilter,
    pub clustering: ClusteringConfig,
    pub executor: LayerExecutor,
}

impl Default for PointClusteringConfig {
    fn default() -> Self {
        Self {
            significances: vec![0.2, 0.3, 0.5, 0.8, 1.68, 2.0],
            method: Method::Last,
            dataset: "mmlu:miscellaneous".to_string(),
            base_shots: 0,
            few_shots: 5,
            filter: ModelFilter::default(),
            clustering: ClusteringConfig::default(),
            executor: LayerExecutor::default(),
        }
    }
}

impl PointClusteringConfig {
    /// Shot-count pairs evaluated for one model pair
    pub fn shot_pairs(&self, same_model: bool) -> Vec<(u32, u32)> {
        let (zero, few) = (self.base_shots, self.few_shots);
        if same_model {
            vec![(zero, zero), (zero, few)]
        } else {
            vec![(zero, zero), (zero, few), (few, few), (few, zero)]
        }
    }
}

/// Point-clustering driver
pub struct PointClustering<'a, S: TensorStorage + ?Sized> {
    storage: &'a S,
    config: PointClusteringConfig,
}

impl<'a, S: TensorStorage + ?Sized> PointClustering<'a, S> {
    pub fn new(storage: &'a S, config: PointClusteringConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &PointClusteringConfig {
        &self.config
    }

    /// Model pairs that will be compared, after filtering
    pub fn model_pairs(&self, models: Option<Vec<String>>) -> Result<Vec<(String, String)>> {
        let models = match models {
            Some(models) => models,
            None => self
                .storage
                .model_names()
                .context("Failed to list stored models")?,
        };
        Ok(pair_names(&models)
            .into_iter()
            .filter(|pair| self.config.filter.allows(pair))
            .collect())
    }

    /// Compare every model pair under every shot pair and significance.
    ///
    /// Any retrieval or clustering failure aborts the run.
    pub fn run(&self, models: Option<Vec<String>>) -> Result<ResultTable<PointClusteringRow>> {
        let pairs = self.model_pairs(models)?;
        info!(
            "Computing point clustering for {} model pairs (Z = {:?})",
            pairs.len(),
            self.config.significances
        );

        let mut table = ResultTable::new();
        for &z in &self.config.significances {
            info!("Significance Z = {z}");
            for pair in &pairs {
                let (model_i, model_j) = pair;
                for (shots_i, shots_j) in self.config.shot_pairs(model_i == model_j) {
                    let query_i = self.query(model_i, shots_i)?;
                    let query_j = self.query(model_j, shots_j)?;
                    info!("Comparing {query_i} with {query_j}");

                    let comparison = self.compare(&query_i, &query_j, z).inspect_err(|e| {
                        error!("Error comparing {query_i} with {query_j}: {e:#}");
                    })?;

                    table.push(PointClusteringRow {
                        significance: z,
                        couple: pair.clone(),
                        method: self.config.method,
                        train_instances_i: shots_i,
                        train_instances_j: shots_j,
                        adjusted_rand_score: comparison
                            .metric(ComparisonMetric::AdjustedRandScore)
                            .to_vec(),
                        adjusted_mutual_info_score: comparison
                            .metric(ComparisonMetric::AdjustedMutualInfoScore)
                            .to_vec(),
                        mutual_info_score: comparison
                            .metric(ComparisonMetric::MutualInfoScore)
                            .to_vec(),
                        f1_score: comparison.metric(ComparisonMetric::F1Score).to_vec(),
                    });
                }
            }
        }
        Ok(table)
    }

    fn query(&self, model: &str, shots: u32) -> Result<TensorQuery> {
        TensorQuery::new(model, self.config.method, shots, self.config.dataset.as_str())
    }

    fn compare(
        &self,
        query_i: &TensorQuery,
        query_j: &TensorQuery,
        z: f64,
    ) -> Result<LayerwiseComparison> {
        let first = self
            .storage
            .retrieve(query_i)
            .with_context(|| format!("Retrieving {query_i}"))?;
        let second = self
            .storage
            .retrieve(query_j)
            .with_context(|| format!("Retrieving {query_j}"))?;
        parallel_compute_pair(&self.config.executor, &first, &second, z, &self.config.clustering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hidden_states::{HiddenStates, InstanceRecord};
    use crate::storage::InMemoryStorage;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    fn run_states(n: usize, seed: u64) -> HiddenStates {
        let mut rng = StdRng::seed_from_u64(seed);
        let tensor = Array3::from_shape_fn((n, 3, 4), |(i, _, _)| {
            (i % 3) as f32 * 4.0 + rng.gen::<f32>()
        });
        let records = (0..n)
            .map(|i| InstanceRecord::new("mmlu:miscellaneous", ["A", "B"][i % 2]))
            .collect();
        HiddenStates::new(tensor, records).unwrap()
    }

    fn small_config() -> PointClusteringConfig {
        PointClusteringConfig {
            significances: vec![1.68],
            clustering: ClusteringConfig {
                id_range_max: 16,
                id_scale_index: 2,
                density_k: 8,
                halo: false,
            },
            executor: LayerExecutor::sequential(),
            ..Default::default()
        }
    }

    fn storage_with(models: &[&str]) -> InMemoryStorage {
        let mut storage = InMemoryStorage::new();
        for (m, model) in models.iter().enumerate() {
            for shots in [0, 5] {
                let seed = (m as u64) * 10 + u64::from(shots);
                storage.insert(*model, Method::Last, shots, run_states(36, seed));
            }
        }
        storage
    }

    #[test]
    fn test_pair_names() {
        let pairs = pair_names(&names(&["B", "Achat", "A", "Bchat"]));
        assert_eq!(
            pairs,
            vec![
                pair("A", "A"),
                pair("Achat", "Achat"),
                pair("A", "Achat"),
                pair("B", "B"),
                pair("Bchat", "Bchat"),
                pair("B", "Bchat"),
            ]
        );
    }

    #[test]
    fn test_pair_names_drops_unmatched() {
        let pairs = pair_names(&names(&["llama-2-7b", "llama-2-70b", "llama-2-7b-chat"]));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2], pair("llama-2-70b", "llama-2-7b-chat"));
    }

    #[test]
    fn test_default_filter() {
        let filter = ModelFilter::default();
        assert!(filter.is_excluded("llama-2-13b"));
        assert!(!filter.is_excluded("llama-2-7b"));
        assert!(!filter.allows(&pair("llama-2-7b", "llama-2-13b-chat")));
        assert!(ModelFilter::allow_all().allows(&pair("llama-2-13b", "llama-2-13b")));
    }

    #[test]
    fn test_shot_pairs() {
        let config = PointClusteringConfig::default();
        assert_eq!(config.shot_pairs(true), vec![(0, 0), (0, 5)]);
        assert_eq!(config.shot_pairs(false), vec![(0, 0), (0, 5), (5, 5), (5, 0)]);
    }

    #[test]
    fn test_run_rows() {
        let storage = storage_with(&[
            "llama-2-7b",
            "llama-2-7b-chat",
            "llama-2-13b",
            "llama-2-13b-chat",
        ]);
        let driver = PointClustering::new(&storage, small_config());

        let pairs = driver.model_pairs(None).unwrap();
        assert_eq!(pairs.len(), 3);

        let table = driver.run(None).unwrap();
        // 2 + 2 same-model rows, 4 cross-model rows
        assert_eq!(table.len(), 8);
        for row in table.rows() {
            assert_eq!(row.adjusted_rand_score.len(), 2);
            assert_eq!(row.f1_score.len(), 2);
            assert!(row
                .adjusted_mutual_info_score
                .iter()
                .all(|v| v.is_finite()));
        }
        let cross = &table.rows()[4..];
        assert!(cross.iter().all(|r| r.couple == pair("llama-2-7b", "llama-2-7b-chat")));
        assert_eq!(cross[3].train_instances_i, 5);
        assert_eq!(cross[3].train_instances_j, 0);
    }

    #[test]
    fn test_same_run_agrees_with_itself() {
        let storage = storage_with(&["llama-2-7b", "llama-2-7b-chat"]);
        let driver = PointClustering::new(&storage, small_config());
        let table = driver.run(None).unwrap();

        let row = &table.rows()[0];
        assert_eq!(row.couple, pair("llama-2-7b", "llama-2-7b"));
        assert_eq!((row.train_instances_i, row.train_instances_j), (0, 0));
        for v in &row.adjusted_rand_score {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_missing_run_is_fatal() {
        let mut storage = storage_with(&["llama-2-7b"]);
        storage.insert("llama-2-7b-chat", Method::Last, 0, run_states(36, 99));
        let driver = PointClustering::new(&storage, small_config());
        // the chat model has no 5-shot run
        assert!(driver.run(None).is_err());
    }
}
