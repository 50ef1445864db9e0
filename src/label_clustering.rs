//! Clustering of hidden states against ground-truth labels
//!
//! For every significance level and every query: retrieve the run,
//! optionally balance answer letters within each dataset, encode labels,
//! cluster every layer and record one [`LabelClusteringRow`]. Rows so far
//! are checkpointed every `checkpoint_every` queries.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::hidden_states::MetaField;
use crate::labels::LabelEncoding;
use crate::layer::ClusteringConfig;
use crate::metrics::ComparisonMetric;
use crate::orchestrator::{parallel_compute, LayerExecutor};
use crate::query::TensorQuery;
use crate::storage::TensorStorage;
use crate::table::{checkpoint_path, LabelClusteringRow, ResultTable};

/// Experiment variation of the label driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Variation {
    /// Plain clustering
    None,
    /// Equal letter counts within each dataset before clustering
    BalancedLetter,
    /// Leave halo points unassigned
    Halo,
}

#[derive(Debug, Clone)]
pub struct LabelClusteringConfig {
    /// Metadata field providing the ground truth
    pub label: MetaField,
    /// Significance levels, processed in order
    pub significances: Vec<f64>,
    pub variation: Variation,
    pub clustering: ClusteringConfig,
    pub executor: LayerExecutor,
    /// Checkpoints go to `<output_dir>/checkpoints`
    pub output_dir: PathBuf,
    /// Checkpoint name (defaults to the label field)
    pub run_label: Option<String>,
    pub checkpoint_every: usize,
    /// Seed for class balancing
    pub seed: u64,
}

impl Default for LabelClusteringConfig {
    fn default() -> Self {
        Self {
            label: MetaField::LetterGold,
            significances: vec![1.6],
            variation: Variation::None,
            clustering: ClusteringConfig::default(),
            executor: LayerExecutor::default(),
            output_dir: PathBuf::from("outputs"),
            run_label: None,
            checkpoint_every: 3,
            seed: 42,
        }
    }
}

/// Label-clustering driver
pub struct LabelClustering<'a, S: TensorStorage + ?Sized> {
    storage: &'a S,
    config: LabelClusteringConfig,
}

impl<'a, S: TensorStorage + ?Sized> LabelClustering<'a, S> {
    pub fn new(storage: &'a S, config: LabelClusteringConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &LabelClusteringConfig {
        &self.config
    }

    /// Checkpoint file of this run
    pub fn checkpoint_file(&self) -> PathBuf {
        let run_label = self
            .config
            .run_label
            .clone()
            .unwrap_or_else(|| self.config.label.to_string());
        checkpoint_path(&self.config.output_dir, &run_label)
    }

    /// Run every query at every significance level
    pub fn run(&self, queries: &[TensorQuery]) -> Result<ResultTable<LabelClusteringRow>> {
        info!(
            "Computing label clustering with label {} ({} queries, Z = {:?})",
            self.config.label,
            queries.len(),
            self.config.significances
        );

        let checkpoint = self.checkpoint_file();
        let mut clustering = self.config.clustering.clone();
        clustering.halo |= self.config.variation == Variation::Halo;
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut table = ResultTable::new();

        for &z in &self.config.significances {
            info!("Significance Z = {z}");
            for (n, query) in queries.iter().enumerate() {
                info!("Processing query {query}");
                let mut hidden_states = match self.storage.retrieve(query) {
                    Ok(hs) => hs,
                    Err(e) if e.is_not_found() => {
                        warn!("Skipping query {query}: {e}");
                        continue;
                    }
                    Err(e) => {
                        error!("Error processing query {query}: {e}");
                        return Err(e).with_context(|| format!("Retrieving {query}"));
                    }
                };

                if self.config.variation == Variation::BalancedLetter {
                    hidden_states = hidden_states
                        .balance_by_label_within_groups(
                            MetaField::Dataset,
                            MetaField::LetterGold,
                            &mut rng,
                        )
                        .with_context(|| format!("Balancing {query}"))
                        .inspect_err(|e| error!("Error balancing query {query}: {e:#}"))?;
                    info!("Balanced to {} instances", hidden_states.num_instances());
                }

                let labels = LabelEncoding::from_field(&hidden_states, self.config.label)
                    .with_context(|| format!("Building labels for {query}"))
                    .inspect_err(|e| error!("Error building labels for query {query}: {e:#}"))?;

                let layerwise = match parallel_compute(
                    &self.config.executor,
                    &hidden_states,
                    &labels,
                    z,
                    &clustering,
                ) {
                    Ok(out) => out,
                    Err(e) => {
                        error!("Error computing clustering for query {query}: {e:#}");
                        return Err(e.context(format!("Clustering {query}")));
                    }
                };

                table.push(LabelClusteringRow {
                    model: query.model_name().to_string(),
                    method: query.method(),
                    train_instances: query.train_instances(),
                    significance: z,
                    clustering_bincount: layerwise.bincount.clone(),
                    adjusted_rand_score: layerwise
                        .metric(ComparisonMetric::AdjustedRandScore)
                        .to_vec(),
                    adjusted_mutual_info_score: layerwise
                        .metric(ComparisonMetric::AdjustedMutualInfoScore)
                        .to_vec(),
                    mutual_info_score: layerwise.metric(ComparisonMetric::MutualInfoScore).to_vec(),
                    f1_score: layerwise.metric(ComparisonMetric::F1Score).to_vec(),
                    clusters_assignment: layerwise.clusters_assignment,
                    labels: layerwise.labels,
                });

                if n % checkpoint_every == 0 {
                    table.write_json(&checkpoint)?;
                    info!(
                        "Checkpoint with {} rows written to {}",
                        table.len(),
                        checkpoint.display()
                    );
                }
            }
        }

        Ok(table)
    }
}
