use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use mentord::api::{self, AppState};
use mentord::clock::SystemClock;
use mentord::compactor;
use mentord::config::Config;
use mentord::engine::Engine;
use mentord::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    mentord::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        hub.clone(),
        Arc::new(SystemClock),
        config.policy,
    )?);

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, threshold).await;
    });

    let app = api::router(AppState {
        engine,
        hub,
        horizon_ms: config.horizon_ms,
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("mentord listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  conflict rule: {}", config.policy.conflict_rule);
    info!("  initial status: {}", config.policy.initial_status);
    info!("  archive horizon: {}h", config.horizon_ms / mentord::model::HOUR_MS);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("mentord stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}
