// =============================================================================
// Kline Tracker — Main Entry Point
// =============================================================================
//
// Startup order per instrument: restore or backfill the base series, bring it
// up to date, derive the coarser resolutions, then attach the live stream.
// Ctrl-C stops every pipeline and waits for its final snapshot.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kline_tracker::api;
use kline_tracker::app_state::AppState;
use kline_tracker::backfill::HistoricalFetcher;
use kline_tracker::binance::{BinanceClient, RateLimitTracker};
use kline_tracker::indicators::IndicatorSet;
use kline_tracker::market_data::kline_stream;
use kline_tracker::pipeline::InstrumentContext;
use kline_tracker::runtime_config::{TrackerConfig, DEFAULT_CONFIG_PATH};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Kline Tracker — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = TrackerConfig::load(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        TrackerConfig::default()
    });
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    info!(
        symbols = ?config.symbols,
        base = %config.base_interval,
        derived = ?config.derived_intervals.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
        data_dir = %config.data_dir.display(),
        "Configured instruments"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let rate_limit = Arc::new(RateLimitTracker::new());
    let client = Arc::new(BinanceClient::new(Arc::clone(&rate_limit))?);

    let mut symbols = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        match client.symbol_exists(symbol).await {
            Ok(true) => symbols.push(symbol.clone()),
            Ok(false) => warn!(symbol = %symbol, "Symbol not listed or not trading, skipping"),
            Err(e) => {
                // Keep it: bootstrap will surface a persistent failure.
                warn!(symbol = %symbol, error = %e, "Symbol check failed, tracking anyway");
                symbols.push(symbol.clone());
            }
        }
    }

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&rate_limit)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fetcher: Arc<dyn HistoricalFetcher> = client;

    // ── 4. Bootstrap pipelines and attach streams ────────────────────────
    let mut pipelines = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let indicators = IndicatorSet::from_config(&config.indicators)?;
        let ctx = match InstrumentContext::bootstrap(
            symbol,
            &config,
            Arc::clone(&fetcher),
            indicators,
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Bootstrap failed, instrument not tracked");
                state.push_error(Some(symbol), e.to_string());
                continue;
            }
        };
        state.register(ctx.handle());

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let sym = symbol.clone();
        pipelines.push((
            sym.clone(),
            tokio::spawn(ctx.run(rx, shutdown_rx.clone())),
        ));

        let interval = config.base_interval;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = kline_stream::run_kline_stream(&sym, interval, &tx) => {
                        if let Err(e) = result {
                            error!(symbol = %sym, error = %e, "Kline stream error — reconnecting in 5s");
                        }
                    }
                }
                if tx.is_closed() || *shutdown.borrow() {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            info!(symbol = %sym, "Kline stream stopped");
        });
    }

    info!(count = pipelines.len(), "Instrument pipelines launched");

    // ── 5. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");
    let app = api::rest::router(Arc::clone(&state));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received — writing final snapshots");
    let _ = shutdown_tx.send(true);

    for (symbol, handle) in pipelines {
        match handle.await {
            Ok(Ok(())) => info!(symbol = %symbol, "Pipeline stopped"),
            Ok(Err(e)) => error!(symbol = %symbol, error = %e, "Final snapshot failed"),
            Err(e) => error!(symbol = %symbol, error = %e, "Pipeline task panicked"),
        }
    }

    if let Err(e) = config.save(DEFAULT_CONFIG_PATH) {
        error!(error = %e, "Failed to save tracker config on shutdown");
    }

    info!("Kline Tracker stopped");
    Ok(())
}
