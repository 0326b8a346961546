use anyhow::Result;
use sandbox_logging::{init_subscriber, LogSettings};
use sandbox_orchestrator::db::{backup_database, create_pool, run_migrations};
use sandbox_orchestrator::SandboxOrchestrator;
use sandbox_worker::{get_provider, start_sweeper_task, start_worker_pool, WorkerConfig};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env());

    info!("Starting sandbox-worker...");

    // Load configuration
    let config = WorkerConfig::from_env()?;
    let orchestrator_config = config.orchestrator_config()?;
    info!(
        "Configuration loaded: workers={}, provider={}, db_path={}",
        config.workers,
        config.provider,
        config.db_path.display()
    );

    let provider = get_provider(&config.provider)?;

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let orchestrator = SandboxOrchestrator::new(pool, orchestrator_config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokio::spawn(start_sweeper_task(
        orchestrator.sweeper(),
        config.sweep_interval_secs,
        shutdown_rx.clone(),
    ));
    info!(
        "Lease sweeper started (interval: {}s)",
        config.sweep_interval_secs
    );

    let workers = start_worker_pool(
        &orchestrator,
        provider,
        config.workers,
        config.idle_poll(),
        shutdown_rx,
    );
    info!("{} worker session(s) started", workers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, cancelling in-flight attempts");
    shutdown_tx.send(true)?;

    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    info!("sandbox-worker stopped");
    Ok(())
}
