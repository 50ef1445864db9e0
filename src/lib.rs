// Pedantic clippy configuration for numerical code
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional in estimators
#![allow(clippy::cast_possible_truncation)] // usize→i32 for cluster ids
#![allow(clippy::cast_possible_wrap)] // usize→i32 for cluster ids
#![allow(clippy::many_single_char_names)] // n, k, d, z standard in math
#![allow(clippy::similar_names)] // related variables like `n1`/`n2`
#![allow(clippy::module_name_repetitions)] // LayerClustering in layer.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! hidden-clusters: density-peak clustering of transformer hidden states
//!
//! Measures, layer by layer, how well the geometry of stored hidden
//! representations matches ground-truth labels, and how similarly two
//! models partition the same instances.
//!
//! ## Architecture
//!
//! - `query`: Typed queries selecting one stored run
//! - `hidden_states`: Hidden-state tensor bound to its instance records
//! - `storage`: Retrieval trait with safetensors and in-memory backends
//! - `error`: Typed retrieval errors
//! - `labels`: Dense integer labels from a metadata field
//! - `neighbors`: k-nearest-neighbor graph
//! - `intrinsic_dim`: Gride intrinsic-dimension estimator
//! - `density`: kNN log-density estimator
//! - `adp`: Advanced Density Peaks clustering
//! - `metrics`: Partition comparison scores (ARI, AMI, MI, F1)
//! - `layer`: Per-layer clustering unit
//! - `orchestrator`: Layer-parallel execution and result merging
//! - `table`: Result rows, tables and checkpoints
//! - `label_clustering`: Clusters vs. ground-truth labels driver
//! - `point_clustering`: Clustering agreement between runs driver

pub mod adp;
pub mod density;
pub mod error;
pub mod hidden_states;
pub mod intrinsic_dim;
pub mod label_clustering;
pub mod labels;
pub mod layer;
pub mod metrics;
pub mod neighbors;
pub mod orchestrator;
pub mod point_clustering;
pub mod query;
pub mod storage;
pub mod table;

pub use adp::{cluster_adp, AdpClustering, HALO};
pub use density::{density_knn, DensityEstimate};
pub use error::RetrievalError;
pub use hidden_states::{HiddenStates, InstanceRecord, MetaField};
pub use intrinsic_dim::{id_scaling_gride, ScaleEstimate};
pub use label_clustering::{LabelClustering, LabelClusteringConfig, Variation};
pub use labels::LabelEncoding;
pub use layer::{process_layer, process_layer_pair, ClusteringConfig, LayerResult, PairLayerResult};
pub use metrics::ComparisonMetric;
pub use neighbors::NeighborGraph;
pub use orchestrator::{
    parallel_compute, parallel_compute_pair, LayerExecutor, LayerwiseClustering,
    LayerwiseComparison,
};
pub use point_clustering::{pair_names, ModelFilter, PointClustering, PointClusteringConfig};
pub use query::{Method, TensorQuery};
pub use storage::{InMemoryStorage, SafetensorsStorage, TensorStorage};
pub use table::{checkpoint_path, LabelClusteringRow, PointClusteringRow, ResultTable};
