mod auth;
mod logging;
mod mcp;
mod routes;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use foreman_agent::claude::ClaudeBackend;
use foreman_core::{
    config::Config,
    db::Db,
    git::WorktreeManager,
    memory::MemoryStore,
    queue::QueueController,
    runner::RunnerContext,
    scheduler::PredictiveScheduler,
    stream::JobStreamManager,
};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::info;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub ctx: Arc<RunnerContext>,
    pub queue: Arc<QueueController>,
    pub scheduler: Arc<PredictiveScheduler>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    pub log_tx: broadcast::Sender<String>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "foreman_server=info,foreman_core=info,foreman_agent=info,tower_http=warn".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    if config.auth_token.is_empty() {
        eprintln!("FOREMAN_AUTH_TOKEN is not set; refusing to start");
        std::process::exit(1);
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/foreman.db", config.data_dir);
    let db = Db::open(&db_path)?;
    db.migrate()?;
    let db = Arc::new(db);

    let config = Arc::new(config);
    let worktrees = Arc::new(WorktreeManager::new(&config));
    let backend = Arc::new(
        ClaudeBackend::new(config.claude_bin.as_str(), config.model.as_str())
            .with_kill_grace(std::time::Duration::from_secs(config.kill_grace_s)),
    );

    let (nudge_tx, mut nudge_rx) = mpsc::unbounded_channel::<()>();
    let ctx = Arc::new(RunnerContext {
        db: Arc::clone(&db),
        config: Arc::clone(&config),
        worktrees,
        backend,
        streams: JobStreamManager::new(),
        memory: Arc::new(MemoryStore::new()),
        nudge_tx,
    });

    let queue = QueueController::new(Arc::clone(&ctx));

    // Crash recovery before anything can enqueue: running rows from a dead
    // process go back to queued.
    queue.init().await?;

    // Nudge loop: enqueues and freed capacity wake the admission pass
    // without waiting for the timer.
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while nudge_rx.recv().await.is_some() {
                queue.process().await;
            }
        });
    }

    // Queue tick loop; the inner spawn catches panics so the loop never dies.
    {
        let queue = Arc::clone(&queue);
        let tick_secs = config.queue_tick_s;
        tokio::spawn(async move {
            loop {
                let q = Arc::clone(&queue);
                let handle = tokio::spawn(async move { q.process().await });
                if let Err(join_err) = handle.await {
                    tracing::error!("queue tick panicked: {join_err}");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(tick_secs)).await;
            }
        });
    }

    let state = Arc::new(AppState {
        ctx,
        queue,
        scheduler: Arc::new(PredictiveScheduler::new()),
        log_ring,
        log_tx,
        start_time: Instant::now(),
    });

    let protected = Router::new()
        // Clients
        .route("/clients", get(routes::list_clients))
        .route("/clients/:id", get(routes::get_client))
        .route("/clients/:id/repository", post(routes::attach_repository))
        .route(
            "/clients/:id/constitution",
            get(routes::get_constitution).post(routes::regenerate_constitution),
        )
        // Jobs
        .route("/jobs", get(routes::list_jobs).post(routes::create_job))
        .route("/jobs/:id", get(routes::get_job))
        .route("/jobs/:id/cancel", post(routes::cancel_job))
        .route("/jobs/:id/retry", post(routes::retry_job))
        .route("/jobs/:id/message", post(routes::send_job_message))
        .route("/jobs/:id/complete", post(routes::complete_job))
        .route("/jobs/:id/iterations", get(routes::list_job_iterations))
        .route("/jobs/:id/stop", post(routes::stop_job))
        .route("/jobs/:id/stream", get(routes::stream_job))
        // Queue
        .route("/queue", get(routes::queue_status))
        // Features / spec pipeline
        .route("/features/:id/generate-tasks", post(routes::generate_tasks))
        .route("/features/:id/spec/start", post(routes::start_spec))
        .route("/features/:id/spec/phase", post(routes::run_spec_phase))
        .route("/features/:id/spec", get(routes::get_spec))
        .route(
            "/features/:id/spec/clarifications/:cid",
            post(routes::answer_clarification),
        )
        .route("/features/:id/spec/output", put(routes::patch_spec_output))
        .route("/spec/phases", get(routes::list_spec_phases))
        // Worktree manager surface
        .route("/sync", post(routes::sync_repos))
        .route("/repos/clone", post(routes::clone_repo))
        .route("/repos/:id/clone", post(routes::clone_repo_by_id))
        // Scheduling (§4.8 surface)
        .route("/scheduling/predict", post(routes::scheduling_predict))
        .route("/scheduling/jobs/:id/schedule", post(routes::scheduling_schedule))
        .route("/scheduling/next", get(routes::scheduling_next))
        .route("/scheduling/metrics", get(routes::scheduling_metrics))
        .route("/scheduling/usage", post(routes::scheduling_usage))
        .route("/scheduling/capacity", get(routes::scheduling_capacity))
        .route(
            "/scheduling/weights",
            get(routes::scheduling_weights).put(routes::scheduling_import_weights),
        )
        // Logs
        .route("/logs/recent", get(routes::recent_logs))
        // MCP (HTTP transport)
        .route("/mcp/info", get(mcp::info))
        .route("/mcp/tools", get(mcp::list_tools))
        .route("/mcp/tools/:name", post(mcp::call_tool))
        .route("/mcp/resources", get(mcp::list_resources))
        .route("/mcp/resources/:rtype", get(mcp::get_resource_root))
        .route("/mcp/resources/:rtype/:id", get(mcp::get_resource))
        .route("/mcp/resources/:rtype/:id/:sub", get(mcp::get_resource_sub))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::bearer_auth,
        ));

    let app = Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!(
        machine = %config.machine_id,
        max_concurrent = config.max_concurrent_jobs,
        "foreman listening on {addr}"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining");
        })
        .await?;
    Ok(())
}
