//! hidden-clusters CLI: layer-wise clustering of stored hidden states

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hidden_clusters::{
    ClusteringConfig, LabelClustering, LabelClusteringConfig, LayerExecutor, MetaField, Method,
    ModelFilter, PointClustering, PointClusteringConfig, SafetensorsStorage, TensorQuery,
    TensorStorage, Variation,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hidden-clusters")]
#[command(about = "Density-peak clustering of transformer hidden states")]
#[command(version)]
struct Cli {
    /// Root directory of the stored hidden states
    #[arg(short, long, default_value = "hidden_states")]
    storage: PathBuf,

    /// Output directory for result tables and checkpoints
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Process layers one after another instead of in a worker pool
    #[arg(long, global = true)]
    sequential: bool,

    /// Worker count (defaults to the available parallelism)
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(flatten)]
    clustering: ClusteringArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ClusteringArgs {
    /// Largest neighbor rank used by the intrinsic-dimension scaling
    #[arg(long, default_value_t = 100)]
    id_range_max: usize,

    /// Index of the intrinsic-dimension scale (n1 = 2^index)
    #[arg(long, default_value_t = 3)]
    id_scale_index: usize,

    /// Neighbors used by the density estimator
    #[arg(long, default_value_t = 16)]
    density_k: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Cluster every run and score the clusters against a label
    Label {
        /// Models to process (defaults to every stored model)
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,

        #[arg(long, value_enum, value_delimiter = ',', default_value = "last")]
        methods: Vec<Method>,

        #[arg(long, value_delimiter = ',', default_value = "0,5")]
        shots: Vec<u32>,

        /// Dataset selector ("mmlu" selects every "mmlu:<subject>")
        #[arg(short, long, default_value = "mmlu")]
        dataset: String,

        /// Metadata field used as ground truth
        #[arg(short, long, value_enum, default_value = "letter_gold")]
        label: MetaField,

        #[arg(short = 'z', long, value_delimiter = ',', default_value = "1.6")]
        significance: Vec<f64>,

        #[arg(long, value_enum, default_value = "none")]
        variation: Variation,

        /// Seed for class balancing
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Compare the clusterings of base and chat model pairs
    Point {
        /// Models to pair (defaults to every stored model)
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,

        #[arg(long, value_enum, default_value = "last")]
        method: Method,

        #[arg(short, long, default_value = "mmlu:miscellaneous")]
        dataset: String,

        #[arg(
            short = 'z',
            long,
            value_delimiter = ',',
            default_value = "0.2,0.3,0.5,0.8,1.68,2.0"
        )]
        significance: Vec<f64>,

        /// Skip models whose name contains any of these substrings
        #[arg(long, value_delimiter = ',', default_value = "13")]
        exclude: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== hidden-clusters ===");
    println!("Storage: {}", cli.storage.display());
    println!("Output:  {}", cli.output.display());

    let storage = SafetensorsStorage::new(&cli.storage);
    let executor = match (cli.sequential, cli.workers) {
        (true, _) => LayerExecutor::sequential(),
        (false, Some(n)) => LayerExecutor::parallel(n),
        (false, None) => LayerExecutor::default(),
    };
    let clustering = ClusteringConfig {
        id_range_max: cli.clustering.id_range_max,
        id_scale_index: cli.clustering.id_scale_index,
        density_k: cli.clustering.density_k,
        halo: false,
    };
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;

    match cli.command {
        Command::Label {
            models,
            methods,
            shots,
            dataset,
            label,
            significance,
            variation,
            seed,
        } => {
            let models = if models.is_empty() {
                storage.model_names()?
            } else {
                models
            };
            let queries = TensorQuery::grid(&models, &methods, &shots, &dataset)?;
            info!("{} models, {} queries", models.len(), queries.len());

            let config = LabelClusteringConfig {
                label,
                significances: significance,
                variation,
                clustering,
                executor,
                output_dir: cli.output.clone(),
                seed,
                ..Default::default()
            };
            let table = LabelClustering::new(&storage, config).run(&queries)?;

            let results_path = cli.output.join(format!("label_cluster_{label}.json"));
            table.write_json(&results_path)?;
            println!("\n{} rows saved to {}", table.len(), results_path.display());
        }
        Command::Point {
            models,
            method,
            dataset,
            significance,
            exclude,
        } => {
            let config = PointClusteringConfig {
                significances: significance,
                method,
                dataset,
                filter: ModelFilter::new(exclude.into_iter().filter(|s| !s.is_empty()).collect()),
                clustering,
                executor,
                ..Default::default()
            };
            let models = (!models.is_empty()).then_some(models);
            let table = PointClustering::new(&storage, config).run(models)?;

            let results_path = cli.output.join("point_cluster.json");
            table.write_json(&results_path)?;
            println!("\n{} rows saved to {}", table.len(), results_path.display());
        }
    }

    Ok(())
}
