use flowbot::api::okx::OkxClient;
use flowbot::config::BotConfig;
use flowbot::db::PostgresStore;
use flowbot::engine::{FlowMonitor, MonitorConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 FlowBot starting - ETF flow monitoring");

    let config = BotConfig::from_env()?;
    config.validate()?;

    tracing::info!("📊 Configuration:");
    tracing::info!("  Check interval: {:?}", config.check_interval);
    tracing::info!("  Flow threshold: {}", config.min_flow_threshold);
    tracing::info!("  Max position: {} USDT", config.max_position_notional);
    tracing::info!(
        "  Tracked assets: {}",
        config
            .tracked_assets
            .iter()
            .map(|a| a.symbol.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let store = Arc::new(PostgresStore::new(&config.database_url).await?);
    tracing::info!("Connected to Postgres flow store");

    let exchange = Arc::new(OkxClient::new(&config.okx)?);

    // A quick look at where the flow data currently stands; records at or
    // before startup are never traded on, only ones that arrive afterwards.
    for asset in &config.tracked_assets {
        match store.latest_record(&asset.symbol).await {
            Ok(Some(record)) => tracing::info!(
                "  {} latest flow: {} ({})",
                asset.symbol,
                record.total_flow,
                record.date
            ),
            Ok(None) => tracing::info!("  {} has no flow records yet", asset.symbol),
            Err(e) => tracing::warn!("  {} latest flow lookup failed: {}", asset.symbol, e),
        }
    }

    let monitor = FlowMonitor::new(
        MonitorConfig::from(&config),
        store.clone(),
        exchange,
        store,
    );
    monitor.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping monitor...");
    monitor.stop().await;

    let stats = monitor.stats();
    tracing::info!(
        "Final stats: {} signals, {} trades executed, {} failed ({:.0}% success)",
        stats.total_signals,
        stats.successful_trades,
        stats.failed_trades,
        stats.success_rate()
    );

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowbot=info".into()),
        )
        .init();
}
