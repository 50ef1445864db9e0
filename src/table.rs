//! Result rows, result tables and checkpoint files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::query::Method;

/// One (model, method, shot count, significance) row of the label driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelClusteringRow {
    pub model: String,
    pub method: Method,
    pub train_instances: u32,
    pub significance: f64,
    /// Per layer: cluster x label counts
    pub clustering_bincount: Vec<Vec<Vec<u64>>>,
    pub adjusted_rand_score: Vec<f64>,
    pub adjusted_mutual_info_score: Vec<f64>,
    pub mutual_info_score: Vec<f64>,
    pub f1_score: Vec<f64>,
    pub clusters_assignment: Vec<Vec<i32>>,
    pub labels: Vec<Vec<i32>>,
}

/// One (model pair, shot pair, significance) row of the point driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointClusteringRow {
    pub significance: f64,
    pub couple: (String, String),
    pub method: Method,
    pub train_instances_i: u32,
    pub train_instances_j: u32,
    pub adjusted_rand_score: Vec<f64>,
    pub adjusted_mutual_info_score: Vec<f64>,
    pub mutual_info_score: Vec<f64>,
    pub f1_score: Vec<f64>,
}

/// Rows accumulated by a driver run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultTable<R> {
    rows: Vec<R>,
}

impl<R> Default for ResultTable<R> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<R> ResultTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: R) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<R> {
        self.rows
    }
}

impl<R: Serialize> ResultTable<R> {
    /// Write the table as a JSON array, replacing any existing file.
    ///
    /// The content goes to a sibling temp file first and is renamed into
    /// place, so readers never see a partial table.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(&self.rows).context("Failed to serialize result table")?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move table into {}", path.display()))?;
        Ok(())
    }
}

impl<R: DeserializeOwned> ResultTable<R> {
    pub fn read_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let rows = serde_json::from_str(&content)
            .with_context(|| format!("Malformed result table {}", path.display()))?;
        Ok(Self { rows })
    }
}

impl<R> FromIterator<R> for ResultTable<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

/// `<output_dir>/checkpoints/checkpoint_<label>_cluster.json`
pub fn checkpoint_path(output_dir: &Path, label: &str) -> PathBuf {
    output_dir
        .join("checkpoints")
        .join(format!("checkpoint_{label}_cluster.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(model: &str) -> PointClusteringRow {
        PointClusteringRow {
            significance: 1.6,
            couple: (model.to_string(), format!("{model}-chat")),
            method: Method::Last,
            train_instances_i: 0,
            train_instances_j: 5,
            adjusted_rand_score: vec![0.1, 0.2],
            adjusted_mutual_info_score: vec![0.3, 0.4],
            mutual_info_score: vec![0.5, 0.6],
            f1_score: vec![0.7, 0.8],
        }
    }

    #[test]
    fn test_checkpoint_path() {
        let path = checkpoint_path(Path::new("/tmp/out"), "letter_gold");
        assert_eq!(
            path,
            PathBuf::from("/tmp/out/checkpoints/checkpoint_letter_gold_cluster.json")
        );
    }

    #[test]
    fn test_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.json");

        let table: ResultTable<_> = vec![row("llama-2-7b"), row("llama-2-70b")]
            .into_iter()
            .collect();
        table.write_json(&path).unwrap();
        let smaller: ResultTable<_> = vec![row("mistral-7b")].into_iter().collect();
        smaller.write_json(&path).unwrap();

        let back: ResultTable<PointClusteringRow> = ResultTable::read_json(&path).unwrap();
        assert_eq!(back, smaller);
        assert!(!path.with_extension("json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["couple"][1], "mistral-7b-chat");
        assert_eq!(raw[0]["method"], "last");
    }
}
