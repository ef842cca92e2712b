use clap::{Parser, Subcommand};
use sluice_core::{FetchRequest, Response};
use sluice_hub::api::{self, AppState};
use sluice_hub::memory::{MemoryGraph, MemoryTimeseries};
use sluice_hub::{Config, Pipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "sluice-hub",
    version,
    about = "SLUICE query hub: metadata-driven timeseries fetch"
)]
struct Args {
    /// Path to config file
    #[arg(long, default_value = "sluice.toml")]
    config: PathBuf,

    /// Server bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API until interrupted
    Serve,
    /// Run fetch requests from JSON files and print every response
    Query {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sluice_hub=info,sluice_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let store = match MemoryGraph::connect(&config.metadata.store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let backend = match MemoryTimeseries::connect(&config.timeseries.backend) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let health = Arc::new(Pipeline::health());
    let pipeline = match Pipeline::start(&config, store, backend, &health, shutdown.clone()).await
    {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!("Failed to start pipeline: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Serve => serve(&config, pipeline, health, shutdown).await,
        Command::Query { files } => {
            let failed = run_queries(&pipeline, &files).await;
            pipeline.shutdown().await;
            if failed {
                std::process::exit(2);
            }
        }
    }
}

async fn serve(
    config: &Config,
    pipeline: Pipeline,
    health: Arc<sluice_hub::Health>,
    shutdown: CancellationToken,
) {
    let state = Arc::new(AppState {
        pipeline,
        health,
        start_time: Instant::now(),
    });
    let app = api::router(state.clone());

    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.server.bind, e);
            state.pipeline.shutdown().await;
            std::process::exit(1);
        }
    };
    tracing::info!("SLUICE hub listening on http://{}", config.server.bind);

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await;
    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
    }
    state.pipeline.shutdown().await;
}

/// Returns `true` if any request could not be run or reported errors.
async fn run_queries(pipeline: &Pipeline, files: &[PathBuf]) -> bool {
    let mut failed = false;
    for path in files {
        let fetch = match read_request(path) {
            Ok(fetch) => fetch,
            Err(e) => {
                tracing::error!("Skipping {:?}: {}", path, e);
                failed = true;
                continue;
            }
        };

        let started = Instant::now();
        let responses = match pipeline.submit(fetch).await {
            Ok(responses) => responses.collect().await,
            Err(e) => {
                tracing::error!("Could not submit {:?}: {}", path, e);
                return true;
            }
        };
        for response in &responses {
            if let Response::End(done) = response {
                failed |= !done.errors.is_empty();
            }
            match serde_json::to_string(response) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Could not encode response: {}", e),
            }
        }
        tracing::info!(
            responses = responses.len(),
            "Ran {:?} in {:?}",
            path,
            started.elapsed()
        );
    }
    failed
}

fn read_request(path: &Path) -> Result<FetchRequest, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}
