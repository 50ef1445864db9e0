//! Hidden-state storage
//!
//! [`TensorStorage`] is the retrieval seam used by the drivers. The
//! on-disk layout of [`SafetensorsStorage`] is
//!
//! ```text
//! <root>/<model>/<method>/<shots>shot/hidden_states.safetensors   # [instances, layers, features]
//! <root>/<model>/<method>/<shots>shot/metadata.json               # [InstanceRecord, ...]
//! ```
//!
//! Model names containing `/` are stored with `__` instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array3;
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::Dtype;
use tracing::debug;

use crate::error::RetrievalError;
use crate::hidden_states::{HiddenStates, InstanceRecord};
use crate::query::{Method, TensorQuery};

const TENSOR_FILE: &str = "hidden_states.safetensors";
const METADATA_FILE: &str = "metadata.json";
const TENSOR_NAME: &str = "hidden_states";

/// Read access to stored hidden states
pub trait TensorStorage: Send + Sync {
    /// Hidden states and records selected by `query`, restricted to the
    /// query's dataset
    fn retrieve(&self, query: &TensorQuery) -> Result<HiddenStates, RetrievalError>;

    /// Every model with stored hidden states, sorted
    fn model_names(&self) -> Result<Vec<String>, RetrievalError>;
}

fn restrict_to_dataset(
    hidden_states: &HiddenStates,
    query: &TensorQuery,
) -> Result<HiddenStates, RetrievalError> {
    let selected = hidden_states
        .filter(|r| query.matches_dataset(&r.dataset))
        .map_err(|e| RetrievalError::unknown(query.to_string(), e))?;
    if selected.num_instances() == 0 {
        return Err(RetrievalError::NotFound(format!(
            "{query} (no instances of dataset '{}')",
            query.dataset()
        )));
    }
    Ok(selected)
}

// ---------------------------------------------------------------------------
// Safetensors on disk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SafetensorsStorage {
    root: PathBuf,
}

impl SafetensorsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, model_name: &str, method: Method, train_instances: u32) -> PathBuf {
        self.root
            .join(model_name.replace('/', "__"))
            .join(method.as_str())
            .join(format!("{train_instances}shot"))
    }

    /// Store one run (all datasets) as F32, replacing existing files
    pub fn store(
        &self,
        model_name: &str,
        method: Method,
        train_instances: u32,
        hidden_states: &HiddenStates,
    ) -> Result<()> {
        let dir = self.run_dir(model_name, method, train_instances);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tensor = hidden_states.tensor();
        let bytes: Vec<u8> = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::F32, tensor.shape().to_vec(), &bytes)
            .context("Failed to build tensor view")?;
        let encoded = safetensors::tensor::serialize([(TENSOR_NAME, view)], &None)
            .context("Failed to serialize hidden states")?;
        std::fs::write(dir.join(TENSOR_FILE), encoded)?;

        let metadata = serde_json::to_string(hidden_states.records())?;
        std::fs::write(dir.join(METADATA_FILE), metadata)?;
        debug!(
            "Stored {} x {} x {} hidden states in {}",
            hidden_states.num_instances(),
            hidden_states.num_layers(),
            hidden_states.hidden_dim(),
            dir.display()
        );
        Ok(())
    }

    fn load(&self, query: &TensorQuery, dir: &Path) -> Result<HiddenStates> {
        let data = std::fs::read(dir.join(TENSOR_FILE)).context("Failed to read tensor file")?;
        let st = SafeTensors::deserialize(&data).context("Failed to deserialize tensor file")?;
        let view = st
            .tensor(TENSOR_NAME)
            .with_context(|| format!("Tensor '{TENSOR_NAME}' not found"))?;
        let shape = view.shape();
        anyhow::ensure!(
            shape.len() == 3,
            "Expected [instances, layers, features], got shape {shape:?}"
        );
        let values = decode_f32(&view)?;
        let tensor = Array3::from_shape_vec((shape[0], shape[1], shape[2]), values)
            .context("Tensor data does not match its shape")?;

        let metadata = std::fs::read_to_string(dir.join(METADATA_FILE))
            .context("Failed to read metadata file")?;
        let records: Vec<InstanceRecord> =
            serde_json::from_str(&metadata).context("Malformed metadata file")?;

        debug!("Loaded {query}: shape {shape:?}");
        HiddenStates::new(tensor, records)
    }
}

fn decode_f32(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    let values = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|b| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                f64::from_le_bytes(buf) as f32
            })
            .collect(),
        // bf16 is the upper half of an f32
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| f32::from_bits(u32::from(u16::from_le_bytes([b[0], b[1]])) << 16))
            .collect(),
        other => anyhow::bail!("Unsupported hidden-state dtype: {other:?}"),
    };
    Ok(values)
}

impl TensorStorage for SafetensorsStorage {
    fn retrieve(&self, query: &TensorQuery) -> Result<HiddenStates, RetrievalError> {
        let dir = self.run_dir(query.model_name(), query.method(), query.train_instances());
        if !dir.join(TENSOR_FILE).is_file() || !dir.join(METADATA_FILE).is_file() {
            return Err(RetrievalError::NotFound(format!(
                "{query} (looked in {})",
                dir.display()
            )));
        }
        let hidden_states = self
            .load(query, &dir)
            .map_err(|e| RetrievalError::unknown(query.to_string(), format!("{e:#}")))?;
        restrict_to_dataset(&hidden_states, query)
    }

    fn model_names(&self) -> Result<Vec<String>, RetrievalError> {
        let root = self.root.display().to_string();
        let entries = std::fs::read_dir(&self.root).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RetrievalError::NotFound(root.clone()),
            _ => RetrievalError::unknown(root.clone(), e),
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RetrievalError::unknown(root.clone(), e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().replace("__", "/"));
            }
        }
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// Storage backed by a map, for tests and synthetic runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    runs: HashMap<(String, Method, u32), HiddenStates>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        model_name: impl Into<String>,
        method: Method,
        train_instances: u32,
        hidden_states: HiddenStates,
    ) {
        self.runs
            .insert((model_name.into(), method, train_instances), hidden_states);
    }
}

impl TensorStorage for InMemoryStorage {
    fn retrieve(&self, query: &TensorQuery) -> Result<HiddenStates, RetrievalError> {
        let key = (
            query.model_name().to_string(),
            query.method(),
            query.train_instances(),
        );
        let hidden_states = self
            .runs
            .get(&key)
            .ok_or_else(|| RetrievalError::NotFound(query.to_string()))?;
        restrict_to_dataset(hidden_states, query)
    }

    fn model_names(&self) -> Result<Vec<String>, RetrievalError> {
        let mut names: Vec<String> = self.runs.keys().map(|(m, _, _)| m.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states() -> HiddenStates {
        let tensor =
            Array3::from_shape_fn((4, 3, 2), |(i, l, f)| (i * 10 + l) as f32 + f as f32 * 0.5);
        let records = vec![
            InstanceRecord::new("mmlu:anatomy", "A"),
            InstanceRecord::new("mmlu:miscellaneous", "B"),
            InstanceRecord::new("arc", "C"),
            InstanceRecord::new("mmlu:miscellaneous", "D"),
        ];
        HiddenStates::new(tensor, records).unwrap()
    }

    #[test]
    fn test_in_memory_dataset_filter() {
        let mut storage = InMemoryStorage::new();
        storage.insert("llama-2-7b", Method::Last, 0, states());

        let q = TensorQuery::new("llama-2-7b", Method::Last, 0, "mmlu:miscellaneous").unwrap();
        let hs = storage.retrieve(&q).unwrap();
        assert_eq!(hs.num_instances(), 2);
        assert_eq!(hs.records()[1].letter_gold, "D");
        assert_eq!(hs.tensor()[[1, 2, 0]], 32.0);

        let q = TensorQuery::new("llama-2-7b", Method::Last, 0, "mmlu").unwrap();
        assert_eq!(storage.retrieve(&q).unwrap().num_instances(), 3);
    }

    #[test]
    fn test_in_memory_not_found() {
        let mut storage = InMemoryStorage::new();
        storage.insert("llama-2-7b", Method::Last, 0, states());

        let missing = TensorQuery::new("llama-2-7b", Method::Last, 5, "mmlu").unwrap();
        assert!(storage.retrieve(&missing).unwrap_err().is_not_found());

        let empty = TensorQuery::new("llama-2-7b", Method::Last, 0, "hellaswag").unwrap();
        assert!(storage.retrieve(&empty).unwrap_err().is_not_found());
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SafetensorsStorage::new(dir.path());
        storage
            .store("meta-llama/Llama-2-7b", Method::Last, 5, &states())
            .unwrap();

        let q = TensorQuery::new("meta-llama/Llama-2-7b", Method::Last, 5, "mmlu").unwrap();
        let hs = storage.retrieve(&q).unwrap();
        assert_eq!(hs.num_instances(), 3);
        assert_eq!(hs.num_layers(), 3);
        assert_eq!(hs.hidden_dim(), 2);
        assert_eq!(hs.tensor()[[0, 1, 1]], 1.5);

        assert_eq!(
            storage.model_names().unwrap(),
            vec!["meta-llama/Llama-2-7b".to_string()]
        );
    }

    #[test]
    fn test_safetensors_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SafetensorsStorage::new(dir.path());
        let q = TensorQuery::new("llama-2-7b", Method::Mean, 0, "mmlu").unwrap();
        assert!(storage.retrieve(&q).unwrap_err().is_not_found());

        let run = dir.path().join("llama-2-7b").join("mean").join("0shot");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join(TENSOR_FILE), b"not a safetensors file").unwrap();
        std::fs::write(run.join(METADATA_FILE), b"[]").unwrap();
        let err = storage.retrieve(&q).unwrap_err();
        assert!(matches!(err, RetrievalError::Unknown { .. }));
    }

    #[test]
    fn test_bf16_decoding() {
        let values = [1.0f32, -2.5, 0.15625];
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::BF16, vec![3], &bytes).unwrap();
        assert_eq!(decode_f32(&view).unwrap(), values.to_vec());
    }
}
