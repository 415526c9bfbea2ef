//! deckhand API server and trigger workers.

use clap::Parser;
use deckhand_api::{AppState, routes};
use deckhand_config::CdConfig;
use deckhand_db::services::{
    PgApprovalService, PgFilterStore, PgNotificationSink, PgPromotionService, PgRegistryCatalog,
    PgScanService, PgVariableResolver,
};
use deckhand_db::{
    PgArtifactRepo, PgConfigRepo, PgCustomTagRepo, PgHistoryRepo, PgOverrideRepo,
    PgPipelineRepo, PgStatusRepo, PgWorkflowRepo, create_pool, run_migrations,
};
use deckhand_deployer::{ArgoCdRestClient, GitHubGitOpsClient, HttpHelmClient, KubeClusterReader};
use deckhand_executor::ClusterClients;
use deckhand_trigger::{
    Collaborators, EventSubscriber, PgMessageQueue, ReleaseCoordinator, SUBSCRIBED_TOPICS,
    StatusWatcher, SubscriberWorker, TriggerOrchestrator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Claims older than this belong to a process that died mid-message.
const STALE_CLAIM_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Parser)]
#[command(name = "deckhand-server", about = "CD trigger and release server")]
struct Args {
    /// KDL configuration file.
    #[arg(long, env = "DECKHAND_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Secret for the external-CI webhook signature.
    #[arg(long, env = "DECKHAND_WEBHOOK_SECRET")]
    webhook_secret: Option<String>,

    #[arg(long, env = "ARGOCD_TOKEN", default_value = "")]
    argocd_token: String,

    #[arg(long, env = "GIT_TOKEN", default_value = "")]
    git_token: String,

    /// Subscriber workers draining the message queue.
    #[arg(long, env = "DECKHAND_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds between Helm release status passes.
    #[arg(long, env = "DECKHAND_STATUS_POLL_SECS", default_value_t = 30)]
    status_poll_secs: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DECKHAND_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = CdConfig::load(args.config.as_deref())?;

    info!("Connecting to database...");
    let pool = create_pool(&args.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let clients = ClusterClients::try_default().await?;
    let executor = deckhand_executor::for_type(
        config.default_executor,
        clients.clone(),
        config.executor.clone(),
        config.workflow_template_name.clone(),
    );
    let queue = Arc::new(PgMessageQueue::new(pool.clone()));

    let deps = Collaborators::builder(config.clone())
        .pipelines(Arc::new(PgPipelineRepo::new(pool.clone())))
        .artifacts(Arc::new(PgArtifactRepo::new(pool.clone())))
        .workflows(Arc::new(PgWorkflowRepo::new(pool.clone())))
        .statuses(Arc::new(PgStatusRepo::new(pool.clone())))
        .overrides(Arc::new(PgOverrideRepo::new(pool.clone())))
        .configs(Arc::new(PgConfigRepo::new(pool.clone())))
        .history(Arc::new(PgHistoryRepo::new(pool.clone())))
        .custom_tags(Arc::new(PgCustomTagRepo::new(pool.clone())))
        .executor(executor)
        .helm(Arc::new(HttpHelmClient::new(config.endpoints.helm_url.clone())))
        .gitops(Arc::new(GitHubGitOpsClient::new(
            config.endpoints.git_api_url.clone(),
            args.git_token.clone(),
        )))
        .argocd(Arc::new(ArgoCdRestClient::new(
            config.endpoints.argocd_url.clone(),
            args.argocd_token.clone(),
        )))
        .cluster(Arc::new(KubeClusterReader::new(clients.default_client())))
        .bus(queue.clone())
        .scans(Arc::new(PgScanService::new(pool.clone())))
        .approvals(Arc::new(PgApprovalService::new(pool.clone())))
        .promotions(Arc::new(PgPromotionService::new(pool.clone())))
        .filters(Arc::new(PgFilterStore::new(pool.clone())))
        .registries(Arc::new(PgRegistryCatalog::new(pool.clone())))
        .notifier(Arc::new(PgNotificationSink::new(pool.clone())))
        .variables(Arc::new(PgVariableResolver::new(pool.clone())))
        .build()?;

    let coordinator = Arc::new(ReleaseCoordinator::new(&deps));
    let orchestrator = Arc::new(TriggerOrchestrator::new(&deps, coordinator.clone()));

    queue.release_stale(STALE_CLAIM_AGE).await?;
    match coordinator.process_incomplete_requests().await {
        Ok(n) => info!(republished = n, "Recovered incomplete deployments"),
        Err(e) => warn!(error = %e, "Failed to recover incomplete deployments"),
    }

    let (stop, shutdown) = watch::channel(false);
    let mut background = JoinSet::new();
    let subscriber = Arc::new(EventSubscriber::new(orchestrator.clone()));
    let instance = uuid::Uuid::now_v7();
    for i in 0..args.workers.max(1) {
        let worker = Arc::new(SubscriberWorker::new(
            format!("deckhand-{instance}-{i}"),
            queue.clone(),
            subscriber.clone(),
            SUBSCRIBED_TOPICS.to_vec(),
            config.queue.clone(),
        ));
        background.spawn(worker.run(shutdown.clone()));
    }
    let watcher = StatusWatcher::new(
        orchestrator.clone(),
        Duration::from_secs(args.status_poll_secs),
    );
    let watcher_shutdown = shutdown.clone();
    background.spawn(async move { watcher.run(watcher_shutdown).await });

    let state = AppState::new(pool, orchestrator, args.webhook_secret);
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping workers");
    let _ = stop.send(true);
    coordinator.shutdown();
    while background.join_next().await.is_some() {}
    Ok(())
}
