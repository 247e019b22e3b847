//! decompose server entry point.
//!
//! Wires the container runtime, target registry, orchestrator, job queue,
//! worker pool and completion store together, then serves the HTTP API
//! until Ctrl-C.

use decompose_core::{
    CompletionSink, DirectoryRegistry, JobQueue, JobTracker, MemoryQueue, MemorySink,
    Orchestrator, WorkerPool,
};
use decompose_runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
use decompose_server::{http, AppState, DecomposeConfig, PgCompletionSink, RuntimeKind};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("decompose_server=info".parse()?)
                .add_directive("decompose_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting decompose server");

    let config = DecomposeConfig::from_env();
    tracing::info!(
        http_addr = %config.http_addr,
        runtime = ?config.runtime,
        targets_dir = %config.targets_dir.display(),
        workers = config.workers,
        store = if config.database_url.is_some() { "postgres" } else { "memory" },
        "Configuration loaded"
    );
    config.validate()?;
    config.validate_warn();

    // Container runtime
    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Docker => {
            let docker = DockerRuntime::connect()?.dockerfile(config.dockerfile.clone());
            if let Err(e) = docker.ping().await {
                tracing::warn!(error = %e, "Docker daemon not reachable yet");
            }
            Arc::new(docker)
        }
        RuntimeKind::Memory => {
            tracing::warn!("Using in-memory runtime, no containers will be started");
            Arc::new(MemoryRuntime::new())
        }
    };

    // Completion store
    let sink: Arc<dyn CompletionSink> = match &config.database_url {
        Some(url) => {
            let store = PgCompletionSink::connect(url).await?;
            tracing::info!("Completion store connected");
            Arc::new(store)
        }
        None => Arc::new(MemorySink::new()),
    };

    let registry = Arc::new(DirectoryRegistry::new(config.targets_dir.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        runtime,
        registry,
        config.orchestrator_config(),
    ));
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(config.queue_config()));
    let tracker = Arc::new(JobTracker::new());

    let mut pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&orchestrator),
        Arc::clone(&tracker),
        sink,
        config.worker_config(),
    );
    pool.start();

    let state = AppState::new(orchestrator, queue, tracker, pool.stats());

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, draining jobs...");

    // Stop accepting requests first so nothing is enqueued while draining
    let _ = shutdown_tx.send(());
    let _ = http_handle.await;

    if let Err(e) = pool.shutdown().await {
        tracing::error!(error = %e, "Error during worker shutdown");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}
