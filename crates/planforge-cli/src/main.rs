use clap::{Parser, Subcommand};
use planforge_core::{ConfigHandle, EventKind, Metrics, PlanforgeConfig, StoreBackend};
use planforge_dispatch::{Dispatcher, WorkerPool};
use planforge_events::{CatalogCache, EventBus, SubscriberFilter};
use planforge_gateway::{AppState, GatewayServer};
use planforge_handlers::builtin_registry;
use planforge_orchestrator::Orchestrator;
use planforge_store::{FileStateStore, MemoryStateStore, StateStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "planforge", about = "Planforge — multi-agent planning platform")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "planforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the platform: store, event bus, dispatcher, workers,
    /// orchestrator, and the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one happy-path job in-process against the builtin handlers and
    /// print its event log
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Demo => demo(config).await,
    }
}

async fn load_config(path: &PathBuf) -> anyhow::Result<PlanforgeConfig> {
    if path.exists() {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", path.display())
        })?;
        Ok(toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(PlanforgeConfig::default())
    }
}

/// Builds and starts every component, returning the shared state the
/// gateway serves from.
async fn build_platform(config: PlanforgeConfig) -> anyhow::Result<Arc<AppState>> {
    let handle = ConfigHandle::new(config);
    let snapshot = handle.snapshot();
    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn StateStore> = match snapshot.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
        StoreBackend::File => {
            Arc::new(FileStateStore::open(snapshot.store.data_dir.clone()).await?)
        }
    };

    let bus = EventBus::new(Arc::clone(&store), Arc::clone(&metrics), &snapshot.eventbus);
    let _ = bus.start_heartbeat();

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        handle.clone(),
    );
    let _ = dispatcher.start_lease_reaper();

    let catalog = CatalogCache::new(Arc::clone(&store));
    let _ = catalog.start_invalidation_listener();

    let pool = WorkerPool::new(
        Arc::clone(&dispatcher),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::new(builtin_registry()),
        Arc::clone(&catalog),
        Arc::clone(&metrics),
        handle.clone(),
    );
    pool.start().await;

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&dispatcher),
        Arc::clone(&metrics),
        handle.clone(),
    );
    let _ = orchestrator.start();

    Ok(Arc::new(AppState {
        orchestrator,
        store,
        bus,
        dispatcher,
        catalog,
        metrics,
        config: handle,
    }))
}

async fn serve(
    config: PlanforgeConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let state = build_platform(config).await?;
    let router = GatewayServer::build(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Planforge gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

async fn demo(config: PlanforgeConfig) -> anyhow::Result<()> {
    let state = build_platform(config).await?;

    let job = state
        .orchestrator
        .create_job(
            "demo",
            "Build a URL shortener with an analytics dashboard. Expected load 1k RPS.",
            HashMap::new(),
        )
        .await?;
    println!("job {} created", job.id);

    let mut subscription = state
        .bus
        .subscribe(SubscriberFilter::Job(job.id), Some(0))
        .await?;

    let outcome = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(event) = subscription.recv().await {
            if event.kind == EventKind::Heartbeat {
                continue;
            }
            println!("#{:<3} {}", event.seq, event.kind);

            match event.kind {
                EventKind::ApprovalRequested => {
                    let prd_hash = event
                        .payload
                        .get("prd_hash")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    state.orchestrator.approve(job.id, &prd_hash, None).await?;
                    println!("      approved PRD {}", &prd_hash[..12.min(prd_hash.len())]);
                }
                EventKind::JobCompleted => return Ok::<_, anyhow::Error>(true),
                EventKind::JobFailed => return Ok(false),
                _ => {}
            }
        }
        Ok(false)
    })
    .await
    .map_err(|_| anyhow::anyhow!("demo timed out"))??;

    let artifacts = state.store.artifacts_for_job(job.id).await?;
    println!(
        "{} with {} artifacts",
        if outcome { "completed" } else { "failed" },
        artifacts.len()
    );
    for artifact in artifacts {
        println!("  {:<14} {}", artifact.kind.to_string(), &artifact.hash[..12]);
    }
    Ok(())
}
