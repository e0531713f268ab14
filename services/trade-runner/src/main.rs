//! Trade runner - futures signal pipeline service
//!
//! 1. Loads the pipeline configuration (YAML plus `TRADER__` overrides)
//! 2. Ingests closed bars per configured stream
//! 3. Analyzes, scores and fuses them into signals
//! 4. Opens and monitors positions under the risk controller
//! 5. Serves the operator API until ctrl-c

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use market_data::{BinanceFuturesClient, InMemoryStore, PgStore, TimeSeriesStore};
use trade_runner::{api, PipelineConfig, Runner, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting trade runner...");

    let config = Arc::new(PipelineConfig::load()?);
    info!(
        "Loaded {} pairs, lookback {} days",
        config.data.pairs.len(),
        config.data.lookback_days
    );

    let store: Arc<dyn TimeSeriesStore> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("No database_url configured; using the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };
    let source = Arc::new(BinanceFuturesClient::new(
        config.runtime.fetch_permits,
        config.runtime.retry_policy(),
    )?);

    let runner = Runner::new(config.clone(), store, source, Arc::new(SystemClock))?;
    let shutdown = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr).await?;
    info!("Operator API listening on {}", config.api.bind_addr);
    let app = api::router(runner.api_state());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, draining pipeline...");
                signal_shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    let result = runner.run(shutdown.clone()).await;
    shutdown.cancel();
    server.await??;

    result?;
    info!("Trade runner stopped");
    Ok(())
}
