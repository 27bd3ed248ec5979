mod admin;
mod cancel;
mod config;
mod engine;
mod evaluator;
mod intake;
mod problem_client;
mod publisher;
mod sandbox;
mod scheduler;
mod workdir;


use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use judge_common::config::JudgeConfig;

use admin::AdminState;
use config::LanguageRegistry;
use engine::VerdictEngine;
use intake::Intake;
use problem_client::ProblemClient;
use publisher::{Publisher, RedisSink};
use sandbox::Sandbox;
use scheduler::Scheduler;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("JUDGE_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Judge worker booting...");

    let config = JudgeConfig::load_default().map_err(|e| {
        error!("Failed to load judge configuration: {:#}", e);
        e
    })?;
    info!(node_id = %config.node_id, workers = config.scheduler.max_workers, "Configuration loaded");

    let registry = LanguageRegistry::load(&config.languages_path).map_err(|e| {
        error!("Failed to load language recipes: {:#}", e);
        error!("Make sure {} exists", config.languages_path.display());
        e
    })?;
    info!("Loaded language recipes for: {:?}", registry.list_languages());

    std::fs::create_dir_all(&config.paths.work_dir)
        .with_context(|| format!("Failed to create work dir {}", config.paths.work_dir.display()))?;

    // Verdict engine on top of the kernel sandbox
    let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()));
    let engine = Arc::new(VerdictEngine::new(&config, registry.clone(), sandbox)?);
    let scheduler = Arc::new(Scheduler::start(config.scheduler.clone(), engine)?);

    // XREADGROUP BLOCK holds its connection, so the consumer gets its own
    info!("Connecting to Redis at {}", config.redis_url);
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid Redis URL")?;
    let publish_conn = client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;
    let consume_conn = client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis");

    let publisher = Arc::new(Publisher::start(
        Arc::new(RedisSink::new(publish_conn, &config.bus)),
        config.bus.clone(),
    ));
    let problems = Arc::new(ProblemClient::new(config.problem_service.clone())?);

    let intake = Arc::new(Intake::new(
        config.node_id.clone(),
        config.bus.clone(),
        config.monitor.clone(),
        registry.clone(),
        scheduler.clone(),
        publisher.clone(),
        problems,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer = tokio::spawn(intake.run(consume_conn, shutdown_rx.clone()));

    let admin_server = if config.admin.enabled {
        let app = admin::router(Arc::new(AdminState {
            scheduler: scheduler.clone(),
            registry,
        }));
        let listener = TcpListener::bind(&config.admin.listen_addr)
            .await
            .with_context(|| format!("Failed to bind admin API to {}", config.admin.listen_addr))?;
        info!("Admin API listening on {}", config.admin.listen_addr);

        let mut stop = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    info!(node_id = %config.node_id, "Judge worker ready");

    let mut consumer_outcome = None;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Shutdown signal received"),
        joined = &mut consumer => {
            warn!("Task consumer exited");
            consumer_outcome = Some(joined);
        }
    }

    // Stop intake first so nothing new reaches the scheduler
    let _ = shutdown_tx.send(true);
    let consumer_outcome = match consumer_outcome {
        Some(joined) => joined,
        None => consumer.await,
    };

    scheduler.shutdown().await;

    // Let monitors observe the tasks that finished during shutdown
    tokio::time::sleep(Duration::from_millis(config.monitor.poll_interval_ms + 100)).await;
    publisher.shutdown().await;

    if let Some(server) = admin_server {
        let _ = server.await;
    }

    info!("Judge worker stopped");

    match consumer_outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Task consumer failed: {:#}", e);
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("Task consumer panicked: {}", e)),
    }
}
