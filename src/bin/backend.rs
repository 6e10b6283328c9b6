use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use videolens::{
    adapters::Adapters,
    api,
    config::{DEFAULT_CONFIG_PATH, load_runtime_config_from},
    dispatch::{DispatchConfig, Dispatcher},
    pipeline::Orchestrator,
    security::ensure_not_root,
    service::VideoLens,
    storage::StorageLayout,
    store::{JobRepository, SqliteJobStore},
};

const DEFAULT_LOG_FILTER: &str = "info,videolens=debug";

#[derive(Parser, Debug)]
#[command(author, version, about = "Video upload and analysis server.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(long, value_name = "HOST", help = "Bind host, overrides VIDEOLENS_HOST")]
    host: Option<String>,
    #[arg(long, value_name = "PORT", help = "Bind port, overrides VIDEOLENS_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    ensure_not_root("videolens backend")?;
    let args = Args::parse();

    let mut config = load_runtime_config_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let layout = StorageLayout::new(&config.data_root);
    layout
        .prepare()
        .with_context(|| format!("preparing data directories under {}", layout.root.display()))?;
    let swept = layout.sweep_staging();
    if swept > 0 {
        info!(count = swept, "removed leftover staging files");
    }

    let store: Arc<dyn JobRepository> = Arc::new(
        SqliteJobStore::open(&layout.database_path())
            .with_context(|| format!("opening {}", layout.database_path().display()))?,
    );

    if config.transcription.api_key.is_none() {
        warn!("no transcription API key configured; transcripts will record the failure");
    }
    let adapters = Adapters::from_config(&config.tools, &config.transcription);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        adapters,
        layout.clone(),
        config.frame_concurrency,
    ));
    let dispatcher = Arc::new(Dispatcher::start(
        orchestrator,
        DispatchConfig {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            job_timeout: config.job_timeout,
        },
    ));
    let service = Arc::new(VideoLens::new(store, Arc::clone(&dispatcher), layout));
    service.recover().await.context("recovering interrupted jobs")?;

    let app = api::router(service);
    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing bind host {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
    info!("shutdown requested");
}
