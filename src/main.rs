//! feedmesh node: daemon replicating signed subfeeds through channel buckets.
//!
//! Startup: load/generate identity → open SQLite → join configured channels
//! → start the feed manager dispatch loop → start HTTP API (127.0.0.1).

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches, Parser};
use tokio_util::sync::CancellationToken;

use feedmesh::config::Config;
use feedmesh::feed::store::FeedStore;
use feedmesh::feed::FeedManager;
use feedmesh::hub::pubsub::InMemoryPubsub;
use feedmesh::hub::ChannelHub;
use feedmesh::identity::Identity;

#[derive(Parser)]
#[command(name = "feedmesh", version, about = "Signed subfeed replication over shared buckets")]
struct Cli {
    /// Path to YAML config file (default: <data_dir>/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for identity and database
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP API port (localhost only)
    #[arg(long, default_value_t = 7660)]
    port: u16,

    /// Label reported by the status endpoint
    #[arg(long)]
    node_label: Option<String>,

    /// Subscription renewal period in seconds
    #[arg(long)]
    renewal_period_secs: Option<u64>,

    /// Generate a default config.yaml in data-dir and exit
    #[arg(long)]
    init_config: bool,
}

/// Build the final Config by merging: defaults -> YAML file -> CLI overrides.
fn build_config(cli: &Cli, matches: &clap::ArgMatches) -> anyhow::Result<Config> {
    use clap::parser::ValueSource;

    let data_dir = cli.data_dir.clone();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Config::config_file_path(&data_dir));

    let mut config = match Config::load_from_file(&config_path)? {
        Some(file_config) => {
            tracing::info!(path = %config_path.display(), "loaded config file");
            file_config
        }
        None => {
            tracing::debug!(path = %config_path.display(), "no config file found, using defaults");
            Config::default()
        }
    };

    // Only values the user explicitly passed override the file.
    if matches.value_source("data_dir") == Some(ValueSource::CommandLine) {
        config.data_dir = data_dir;
    }
    if matches.value_source("port") == Some(ValueSource::CommandLine) {
        config.port = cli.port;
    }
    if let Some(label) = &cli.node_label {
        config.node_label = label.clone();
    }
    if let Some(secs) = cli.renewal_period_secs {
        config.sync.renewal_period_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedmesh=info".into()),
        )
        .init();

    let mut matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches_mut(&mut matches)?;

    if cli.init_config {
        std::fs::create_dir_all(&cli.data_dir)?;
        let config_path = Config::config_file_path(&cli.data_dir);
        Config::write_default_config(&config_path)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let config = build_config(&cli, &matches)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let identity = Identity::load_or_generate(&config.identity_dir())?;
    tracing::info!(
        node_id = %identity.public_hex(),
        label = %config.node_label,
        port = config.port,
        "feedmesh starting"
    );

    let store = FeedStore::open(&config.db_path())?;

    // In-process bus: channel peers must share this process to see each
    // other's requests. Buckets may still be external.
    let pubsub = Arc::new(InMemoryPubsub::new(config.pubsub_capacity));
    tracing::info!(capacity = config.pubsub_capacity, "using in-process pubsub");

    let hub = ChannelHub::from_config(identity, pubsub, &config.channels)?;
    let manager = Arc::new(FeedManager::new(
        store,
        Arc::new(hub),
        config.sync.timings(),
    ));

    let cancel = CancellationToken::new();
    let dispatch = manager.spawn(cancel.clone());

    let state = api::AppState {
        manager: manager.clone(),
        config: Arc::new(config.clone()),
        started_at: std::time::Instant::now(),
    };
    let app = api::router(state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Err(e) = dispatch.await {
        tracing::warn!(error = %e, "feed manager task ended abnormally");
    }
    Ok(())
}
