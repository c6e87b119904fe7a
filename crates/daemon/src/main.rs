//! Quell daemon - Main Entry Point
//!
//! Wires the SQLite store, queue engine, memory monitor and optimization
//! controller together, then runs until Ctrl+C.

mod logging;
mod maintenance;
mod metrics;
mod settings;
mod telemetry;

use anyhow::{Context, Result};
use quell_core::application::{shutdown_channel, MemoryMonitor, OptimizationController, QueueEngine};
use quell_core::domain::QueueSettings;
use quell_core::port::id_provider::UuidProvider;
use quell_core::port::time_provider::SystemTimeProvider;
use quell_infra_sqlite::{create_pool, run_migrations, PoolSettings, SqliteQueueStore};
use quell_infra_system::SysinfoMemoryProbe;
use settings::QuellSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// Processor panics are contained by catching them at the job task boundary
#[cfg(panic = "abort")]
compile_error!("quell must be built with panic = \"unwind\" so processor panics stay contained");

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Settings and logging
    let settings = QuellSettings::load()?;
    let _log_guard = logging::init(&settings.logging)?;
    info!("Quell v{} starting...", VERSION);

    // 2. Store
    if let Some(path) = settings.store.file_path() {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    info!(url = %settings.store.url, "Opening store...");
    let pool_settings = PoolSettings {
        max_connections: settings.store.max_connections,
        busy_timeout: Duration::from_millis(settings.store.busy_timeout_ms),
        ..PoolSettings::default()
    };
    let pool = create_pool(&settings.store.url, &pool_settings)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;
    let store = Arc::new(SqliteQueueStore::new(pool.clone()));

    // 3. Engine and queues (restores persisted jobs)
    let time_provider = Arc::new(SystemTimeProvider);
    let engine = QueueEngine::new(
        settings.engine.clone(),
        store.clone(),
        Arc::new(UuidProvider),
        time_provider.clone(),
    );

    let maintenance_queue = QueueSettings::new(settings.maintenance.queue.clone())
        .with_concurrency(1)
        .with_max_attempts(1);
    let mut queues = vec![maintenance_queue];
    queues.extend(settings.queue_settings());
    for queue in queues {
        let name = queue.name.clone();
        let report = engine
            .create_queue(queue)
            .await
            .with_context(|| format!("Failed to create queue '{}'", name))?;
        info!(
            queue = %name,
            restored = report.restored,
            requeued = report.requeued,
            skipped = report.skipped,
            "Queue ready"
        );
    }

    // 4. Monitor and controller
    let optimizer = settings.memory_optimization.controller.clone();
    let monitor = Arc::new(
        MemoryMonitor::new(
            Arc::new(SysinfoMemoryProbe::new()),
            time_provider.clone(),
            settings.memory_optimization.thresholds.clone(),
        )
        .with_usage(Arc::new(engine.clone()))
        .with_pool(store.clone())
        .with_history_window(Duration::from_secs(optimizer.history_window_minutes * 60)),
    );
    let controller = Arc::new(
        OptimizationController::new(engine.clone(), monitor, time_provider, optimizer)
            .with_pool(store.clone()),
    );
    engine.register_processor(
        &settings.maintenance.queue,
        maintenance::COMPACT_JOB,
        maintenance::compact_processor(controller.clone()),
    )?;
    controller.start();

    // 5. Background feeds
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if settings.maintenance.compaction_interval_ms > 0 {
        tasks.push(tokio::spawn(maintenance::run_compaction_schedule(
            engine.clone(),
            settings.maintenance.queue.clone(),
            Duration::from_millis(settings.maintenance.compaction_interval_ms),
            shutdown_rx.clone(),
        )));
    }
    if settings.metrics.enabled {
        tasks.push(tokio::spawn(metrics::run_metrics_feed(
            controller.clone(),
            settings.metrics.interval(),
            shutdown_rx.clone(),
        )));
    }

    info!(queues = ?engine.queue_names(), "System ready");
    info!("Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 7. Graceful shutdown
    shutdown_tx.shutdown();
    controller.stop().await;
    engine.shutdown().await;
    for task in tasks {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Err(e)) => error!(error = %e, "Background task failed"),
            Err(_) => warn!("Background task did not stop in time"),
            Ok(Ok(())) => {}
        }
    }
    pool.close().await;
    telemetry::shutdown();

    info!("Shutdown complete.");
    Ok(())
}
