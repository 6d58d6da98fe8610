use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeloop::application::{LoopContext, TradingScheduler};
use tradeloop::config::EngineConfig;
use tradeloop::infrastructure::build_gateway;
use tradeloop::persistence::{
    init_database_with, AuditLogRepository, DatabaseConfig, SqliteSettingsStore,
    SqliteTradeLedger,
};
use tradeloop::secrets::GatewayCredentials;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Tradeloop starting: {} gateway, poll every {}s, reconcile every {}s",
        config.gateway_mode, config.poll_interval_seconds, config.reconciliation_interval_seconds
    );

    let pool = init_database_with(&DatabaseConfig::from_env()).await?;

    let gateway = build_gateway(&config, GatewayCredentials::from_env())?;

    let ctx = LoopContext {
        settings: Arc::new(SqliteSettingsStore::new(pool.clone())),
        ledger: Arc::new(SqliteTradeLedger::new(pool.clone())),
        gateway,
        audit: Arc::new(AuditLogRepository::new(pool.clone())),
        poll_interval: config.poll_interval(),
        retry: config.retry_policy(),
    };

    let scheduler = TradingScheduler::new(ctx, config.reconciliation_interval());
    let stats = scheduler.run_until(shutdown_signal()).await;
    info!(
        "Scheduler finished: {} loops started, {} panicked",
        stats.started, stats.panicked
    );

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
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
