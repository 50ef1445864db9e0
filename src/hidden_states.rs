//! Hidden-state tensors bound to their instance records
//!
//! [`HiddenStates`] owns the `(instance, layer, feature)` tensor and one
//! [`InstanceRecord`] per instance. Every row filter goes through
//! [`HiddenStates::select`], which applies the same index selection to
//! both halves, so the record order always matches the instance axis.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use ndarray::{Array3, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Metadata for one benchmark instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Dataset (and subject) the instance belongs to, e.g. `mmlu:anatomy`
    pub dataset: String,
    /// Gold answer letter
    pub letter_gold: String,
    /// Letter predicted by the model, when scored
    #[serde(default)]
    pub only_ref_pred: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl InstanceRecord {
    pub fn new(dataset: impl Into<String>, letter_gold: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            letter_gold: letter_gold.into(),
            only_ref_pred: None,
            instance_id: None,
        }
    }

    /// Value of a metadata field, `None` when the record does not carry it
    pub fn field(&self, field: MetaField) -> Option<&str> {
        match field {
            MetaField::Dataset => Some(&self.dataset),
            MetaField::LetterGold => Some(&self.letter_gold),
            MetaField::PredictedLetter => self.only_ref_pred.as_deref(),
        }
    }
}

/// Categorical metadata columns usable for labels and grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum MetaField {
    Dataset,
    LetterGold,
    PredictedLetter,
}

impl fmt::Display for MetaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset => write!(f, "dataset"),
            Self::LetterGold => write!(f, "letter_gold"),
            Self::PredictedLetter => write!(f, "only_ref_pred"),
        }
    }
}

/// A hidden-state tensor and its row-aligned instance records
#[derive(Debug, Clone)]
pub struct HiddenStates {
    tensor: Array3<f32>,
    records: Vec<InstanceRecord>,
}

impl HiddenStates {
    /// Bind a tensor to its records. The record count must match the
    /// instance axis.
    pub fn new(tensor: Array3<f32>, records: Vec<InstanceRecord>) -> Result<Self> {
        anyhow::ensure!(
            tensor.len_of(Axis(0)) == records.len(),
            "Tensor has {} instances but {} records were given",
            tensor.len_of(Axis(0)),
            records.len()
        );
        Ok(Self { tensor, records })
    }

    pub fn num_instances(&self) -> usize {
        self.records.len()
    }

    pub fn num_layers(&self) -> usize {
        self.tensor.len_of(Axis(1))
    }

    pub fn hidden_dim(&self) -> usize {
        self.tensor.len_of(Axis(2))
    }

    pub fn tensor(&self) -> &Array3<f32> {
        &self.tensor
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    /// Instances x features slice for one layer
    pub fn layer(&self, layer: usize) -> Result<ArrayView2<'_, f32>> {
        anyhow::ensure!(
            layer < self.num_layers(),
            "Layer {layer} out of range (n_layers={})",
            self.num_layers()
        );
        Ok(self.tensor.index_axis(Axis(1), layer))
    }

    /// Keep the given instances, in the given order, in both tensor and records
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let n = self.num_instances();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            anyhow::bail!("Instance index {bad} out of range (n_instances={n})");
        }
        let tensor = self.tensor.select(Axis(0), indices);
        let records = indices.iter().map(|&i| self.records[i].clone()).collect();
        Ok(Self { tensor, records })
    }

    /// Keep the instances whose record satisfies `keep`
    pub fn filter(&self, keep: impl Fn(&InstanceRecord) -> bool) -> Result<Self> {
        let indices: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| keep(r))
            .map(|(i, _)| i)
            .collect();
        self.select(&indices)
    }

    /// Down-sample so every `group` value holds equally many instances of
    /// each `label` value.
    ///
    /// Within a group, each label keeps `min_count` instances drawn
    /// uniformly without replacement, where `min_count` is the smallest
    /// label count in that group. Output is ordered by group, then label,
    /// then original position.
    pub fn balance_by_label_within_groups<R: Rng + ?Sized>(
        &self,
        group: MetaField,
        label: MetaField,
        rng: &mut R,
    ) -> Result<Self> {
        let mut buckets: BTreeMap<&str, BTreeMap<&str, Vec<usize>>> = BTreeMap::new();
        for (i, record) in self.records.iter().enumerate() {
            let g = record
                .field(group)
                .with_context(|| format!("Instance {i} has no '{group}' value"))?;
            let l = record
                .field(label)
                .with_context(|| format!("Instance {i} has no '{label}' value"))?;
            buckets.entry(g).or_default().entry(l).or_default().push(i);
        }

        let mut kept = Vec::with_capacity(self.num_instances());
        for labels in buckets.values() {
            let min_count = labels.values().map(Vec::len).min().unwrap_or(0);
            for members in labels.values() {
                let mut picked: Vec<usize> =
                    rand::seq::index::sample(rng, members.len(), min_count)
                        .into_iter()
                        .map(|j| members[j])
                        .collect();
                picked.sort_unstable();
                kept.extend(picked);
            }
        }
        self.select(&kept)
    }
}
