//! CLI entry point for the graphsync connector.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use graphsync_core::{MutationExecutor, SyncConfig};
use graphsync_graph::{GraphClient, GraphConfig};

use graphsync_connector::{
    CheckpointStore, FileCheckpointStore, IdentityMapper, JsonLinesFeed, MemoryCheckpointStore,
    MemoryGraph, Pipeline, PipelineConfig, SyncContext,
};

#[derive(Parser)]
#[command(name = "graphsync")]
#[command(about = "Sync a MongoDB oplog into a Neo4j property graph")]
struct Cli {
    /// Oplog file, one Extended JSON entry per line (default: stdin).
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Checkpoint file (overrides pipeline.checkpoint_path).
    #[arg(short, long)]
    timestamp: Option<PathBuf>,

    /// Config file prefix (default: graphsync).
    #[arg(short, long, default_value = "graphsync")]
    config: String,

    /// Apply to an in-memory graph instead of Neo4j. The checkpoint file is
    /// read but never written.
    #[arg(long)]
    dry_run: bool,

    /// Ignore the stored checkpoint and replay the whole feed.
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    let settings = section::<SyncConfig>(&cfg, "sync")?.validate()?;
    let mut pipeline_config = section::<PipelineConfig>(&cfg, "pipeline")?;
    if let Some(path) = &cli.timestamp {
        pipeline_config.checkpoint_path = path.clone();
    }
    pipeline_config.validate()?;

    let file_store = FileCheckpointStore::new(&pipeline_config.checkpoint_path);
    let start = if cli.reset {
        tracing::info!("Ignoring stored checkpoint");
        None
    } else {
        file_store.load()?
    };
    tracing::info!(
        checkpoint = %file_store.path().display(),
        start = ?start,
        "Resume position loaded"
    );

    let (executor, store): (Arc<dyn MutationExecutor>, Arc<dyn CheckpointStore>) = if cli.dry_run
    {
        tracing::info!("Dry run: applying to an in-memory graph");
        (
            Arc::new(MemoryGraph::new()),
            Arc::new(MemoryCheckpointStore::new(start)),
        )
    } else {
        let graph = GraphClient::connect(&graph_config(&cfg)).await?;
        graph.ensure_schema().await?;
        (Arc::new(graph), Arc::new(file_store))
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut feed = JsonLinesFeed::new(reader).resume_from(start);

    let ctx = SyncContext {
        settings: Arc::new(settings),
        mapper: IdentityMapper::new(),
        executor,
    };
    let pipeline = Pipeline::new(ctx, pipeline_config, store);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl-C received");
    };

    let stats = pipeline.run(&mut feed, start, shutdown).await?;
    tracing::info!(
        skipped_lines = feed.skipped(),
        checkpoint = ?stats.checkpoint,
        "graphsync finished"
    );

    Ok(())
}

fn load_config(file_prefix: &str) -> anyhow::Result<config::Config> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("GRAPHSYNC")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(cfg)
}

/// Deserialize a config section, falling back to defaults when it's absent.
fn section<T>(cfg: &config::Config, key: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match cfg.get::<T>(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(anyhow::anyhow!("Invalid [{key}] configuration: {e}")),
    }
}

fn graph_config(cfg: &config::Config) -> GraphConfig {
    let defaults = GraphConfig::default();
    GraphConfig {
        uri: cfg.get_string("neo4j.uri").unwrap_or(defaults.uri),
        user: cfg.get_string("neo4j.user").unwrap_or(defaults.user),
        password: cfg.get_string("neo4j.password").unwrap_or(defaults.password),
        vertex_label: cfg
            .get_string("neo4j.vertex_label")
            .unwrap_or(defaults.vertex_label),
        ..defaults
    }
}
