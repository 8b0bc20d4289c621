use std::sync::Arc;

use anyhow::Context;
use futures::{Stream, StreamExt};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use crawl_orchestrator::config::OrchestratorConfig;
use crawl_orchestrator::events::{EventBus, EventType, JobEvent};
use crawl_orchestrator::jobs::task_types;
use crawl_orchestrator::manager::{CrawlManager, ManagerRegistry, TransformManager};
use crawl_orchestrator::orchestrator::Orchestrator;
use crawl_orchestrator::pool::{HttpRendererFactory, RendererPool};
use crawl_orchestrator::queue::LibSqlQueue;
use crawl_orchestrator::store::{JobStore, LibSqlStore};
use crawl_orchestrator::worker::{CrawlWorker, JobProcessor, WorkerDeps, WorkerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let seeds: Vec<String> = std::env::args().skip(1).collect();
    if seeds.is_empty() {
        eprintln!("Usage: crawl-orchestrator <seed-url>...");
        eprintln!("  configure with CRAWL_* environment variables, e.g. CRAWL_MAX_DEPTH=1");
        std::process::exit(2);
    }

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;

    if let Some(dir) = config.database_path.parent()
        && !dir.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    // Shared clients, built once and injected everywhere.
    let store = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .context("opening job store")?,
    );
    let queue = Arc::new(LibSqlQueue::new(store.connection(), store.retry_policy()));
    let pool = RendererPool::start(
        Arc::new(HttpRendererFactory::new(config.pool.user_agent.clone())),
        &config.pool,
    )
    .await
    .context("starting renderer pool")?;
    let events = EventBus::new();

    let orchestrator = Orchestrator::new(store.clone(), events.clone(), config.monitor.clone());
    let resumed = orchestrator.recover().await?;
    if resumed > 0 {
        tracing::info!(resumed, "Resumed monitoring of unfinished jobs");
    }

    let workers = Arc::new(WorkerRegistry::new());
    let deps = WorkerDeps {
        store: store.clone(),
        queue: queue.clone(),
        pool: pool.clone(),
        events: events.clone(),
        orchestrator: orchestrator.clone(),
    };
    workers
        .register(Arc::new(CrawlWorker::new(deps, &config.worker, &config.pool)))
        .await;

    let processor = JobProcessor::new(
        queue.clone(),
        workers,
        store.clone(),
        orchestrator.clone(),
        config.worker.clone(),
    );
    processor.start().await;

    let managers = ManagerRegistry::new();
    managers
        .register(Arc::new(CrawlManager::new(
            store.clone(),
            queue.clone(),
            orchestrator.clone(),
            config.crawl.clone(),
        )))
        .await;
    managers
        .register(Arc::new(TransformManager::new(store.clone(), events.clone())))
        .await;

    // Subscribe before submitting so no event is missed.
    let mut stream = Box::pin(events.stream());
    let job_id = managers
        .submit(
            task_types::CRAWL,
            serde_json::json!({ "seeds": seeds, "source_ref": "cli" }),
        )
        .await?;

    eprintln!("Crawl job {job_id} started. Press Ctrl-C to cancel.");

    tokio::select! {
        _ = wait_for_terminal(&mut stream, job_id) => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            orchestrator.cancel_job(job_id, "interrupted by user").await?;
        }
    }

    if let Some(job) = store.get_job(job_id).await? {
        let errors = store.recent_errors(job_id, 5).await?;
        println!("Job {}: {}", job.id, job.status);
        println!("  {}", job.progress.summary());
        println!(
            "  documents: {}, results: {}, failures: {}",
            job.metadata.document_count, job.result_count, job.failed_count
        );
        if let Some(error) = &job.error {
            println!("  error: {error}");
        }
        for warning in &job.metadata.warnings {
            println!("  warning: {warning}");
        }
        for error in errors {
            println!("  recent error: {error}");
        }
    }

    processor.stop().await;
    orchestrator.shutdown().await;
    pool.shutdown().await;
    Ok(())
}

/// Log events of `job_id` until it reaches a terminal status.
async fn wait_for_terminal(stream: &mut (impl Stream<Item = JobEvent> + Unpin), job_id: Uuid) {
    while let Some(event) = stream.next().await {
        if event.job_id != job_id {
            continue;
        }
        match event.event_type {
            EventType::Progress => {
                tracing::info!(
                    job_id = %job_id,
                    progress = event.progress_text.as_deref().unwrap_or(""),
                    "Progress"
                );
            }
            kind if kind.is_terminal() => return,
            _ => {}
        }
    }
}

/// Console logging filtered by `RUST_LOG` (default `info`). When
/// `CRAWL_LOG_DIR` is set, logs also go to a daily rolling file.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = std::env::var("CRAWL_LOG_DIR").ok().filter(|d| !d.is_empty()) else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(dir, "crawl-orchestrator.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}
