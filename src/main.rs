use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use cat_engine::cat::metrics::registry;
use cat_engine::config::Config;
use cat_engine::db::SqliteStore;
use cat_engine::logging::init_tracing;
use cat_engine::AdaptiveTestingController;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level);

    let store = match SqliteStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, url = %config.database_url, "failed to open database");
            std::process::exit(1);
        }
    };
    if let Err(err) = store.migrate().await {
        tracing::error!(error = %err, "failed to apply schema");
        std::process::exit(1);
    }

    let interval = Duration::from_secs(config.cat.checkpoint.interval_secs.max(1));
    let controller = Arc::new(AdaptiveTestingController::bootstrap(config.cat, Arc::new(store)).await);

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = controller.spawn_checkpoint_worker(interval, shutdown_tx.subscribe());
    tracing::info!(
        interval_secs = interval.as_secs(),
        epsilon = controller.agent_epsilon(),
        train_steps = controller.agent_train_steps(),
        "cat-engine running"
    );

    shutdown_signal().await;
    tracing::info!("shutdown requested, stopping checkpoint worker");

    let _ = shutdown_tx.send(());
    if let Err(err) = worker.await {
        tracing::warn!(error = %err, "checkpoint worker ended abnormally");
    }

    match controller.checkpoint().await {
        Ok(()) => tracing::info!("final agent checkpoint saved"),
        Err(err) => tracing::error!(error = %err, "final agent checkpoint failed"),
    }

    for status in registry().snapshot() {
        tracing::info!(
            algorithm = status.id,
            calls = status.calls,
            errors = status.errors,
            mean_latency_ms = status.mean_latency_ms,
            "algorithm metrics"
        );
    }

    tracing::info!("Graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
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
}
