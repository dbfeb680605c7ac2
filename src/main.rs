mod config;
mod error;
mod extract;
mod handlers;
mod http_client;
mod identity;
mod peers;
mod scheduler;
mod store;
mod sync_log;
mod time;

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use config::Config;
use handlers::{router, AppState};
use http_client::PeerClient;
use identity::resolve_identity;
use peers::PeerDirectory;
use scheduler::Scheduler;
use store::LocationStore;
use sync_log::SyncLog;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::default();

    let identity = match resolve_identity(&config) {
        Ok(identity) => identity,
        Err(e) => {
            error!("failed to resolve node identity: {e}");
            std::process::exit(1);
        }
    };
    let self_node_id = identity.self_node_id();
    info!(node_id = %self_node_id, mesh_interface = %config.mesh_interface_name, "identity resolved");

    let store = match LocationStore::connect(&config.database_path).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open location store: {e}");
            std::process::exit(1);
        }
    };

    let sync_log = SyncLog::new(store.pool().clone());
    if let Err(e) = sync_log.run_migrations().await {
        error!("failed to run sync log migrations: {e}");
        std::process::exit(1);
    }

    let directory = PeerDirectory::new(self_node_id.clone(), &config);
    let client = PeerClient::new(config.per_request_timeout_ms, config.listen_port);
    let cancel = tokio_util::sync::CancellationToken::new();

    let scheduler = Scheduler::new(
        store.clone(),
        sync_log,
        Arc::clone(&directory),
        client,
        config.clone(),
        self_node_id.clone(),
        cancel.clone(),
    );

    let scheduler_for_loop = Arc::clone(&scheduler);
    let scheduler_handle = tokio::spawn(async move {
        scheduler_for_loop.run().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = AppState {
        store,
        directory,
        scheduler,
        self_node_id: self_node_id.clone(),
        max_batch_size: config.max_batch_size,
    };

    let app = router(app_state).layer(cors);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind port {}: {e}", config.listen_port);
            std::process::exit(1);
        }
    };
    info!(port = config.listen_port, node_id = %self_node_id, "sync surface listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, stopping scheduler");
            shutdown_cancel.cancel();
        })
        .await
        .unwrap_or_else(|e| error!("server error: {e}"));

    // HTTP connections are drained at this point, but a peer round may still
    // be mid-commit; wait for the tick loop to notice cancellation and
    // return, bounded so a wedged round can't hang shutdown forever.
    let drain_bound = std::time::Duration::from_millis(config.per_round_timeout_ms + 1_000);
    match tokio::time::timeout(drain_bound, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped cleanly"),
        Ok(Err(e)) => error!("scheduler task panicked during shutdown: {e}"),
        Err(_) => error!("scheduler did not stop within {:?}, exiting anyway", drain_bound),
    }
}
