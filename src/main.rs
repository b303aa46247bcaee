use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use rustraptor_signals::{
    config::settings::Settings,
    routes::health::{health_scope, AppState},
    services::{
        candles::Timeframe,
        clock::{ClockSynchronizer, HttpTimeAuthority, SystemClock},
        feed::{BinanceFeed, FeedConfig, FeedSecurity},
        market_data::MarketBus,
        pipeline::{DispatchEvent, Pipeline, StrategySlot},
        scheduler::{BoundaryFire, BoundaryScheduler},
        tick_buffer::TickBuffer,
    },
};

fn init_logging(json: bool) {
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();
    }
}

/// Stand-in for store / execution adapters: logs everything the core emits.
fn spawn_event_logger(bus: &MarketBus) {
    let mut candles = bus.candles.subscribe();
    let mut signals = bus.signals.subscribe();
    let mut boundaries = bus.boundaries.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                r = signals.recv() => match r {
                    Ok(s) => log::info!(
                        "SIGNAL {} {} {} {:?} conf={:.3} @ {}",
                        s.strategy, s.symbol, s.timeframe, s.side, s.confidence, s.price
                    ),
                    Err(RecvError::Lagged(n)) => log::warn!("signal logger lagged by {n}"),
                    Err(RecvError::Closed) => break,
                },
                r = candles.recv() => match r {
                    Ok(c) => log::debug!(
                        "candle {} {} o={} h={} l={} c={} n={}",
                        c.symbol, c.timeframe, c.open, c.high, c.low, c.close, c.tick_count
                    ),
                    Err(RecvError::Lagged(n)) => log::warn!("candle logger lagged by {n}"),
                    Err(RecvError::Closed) => break,
                },
                r = boundaries.recv() => match r {
                    Ok(b) => log::debug!(
                        "boundary {} {} at {} (err {} ms)",
                        b.symbol, b.timeframe, b.boundary, b.timing_error_ms
                    ),
                    Err(RecvError::Lagged(n)) => log::warn!("boundary logger lagged by {n}"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().map_err(|e| anyhow::anyhow!("failed to load settings: {e}"))?;
    init_logging(settings.log_json);

    // strategies may name symbols / timeframes beyond the configured lists
    let symbols: BTreeSet<String> = settings
        .symbols
        .iter()
        .cloned()
        .chain(settings.strategies.iter().map(|s| s.symbol.clone()))
        .collect();
    let timeframes: Vec<Timeframe> = Timeframe::ALL
        .into_iter()
        .filter(|tf| {
            settings.timeframes.contains(tf) || settings.strategies.iter().any(|s| s.timeframe == *tf)
        })
        .collect();
    log::info!(
        "starting signal core: symbols={symbols:?} timeframes={timeframes:?} strategies={}",
        settings.strategies.len()
    );

    if let Some(port) = settings.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("prometheus exporter")?;
        log::info!("metrics on :{port}/metrics");
    }

    // --- clock ---------------------------------------------------------------
    let sync = Arc::new(ClockSynchronizer::new(
        Arc::new(SystemClock),
        Arc::new(HttpTimeAuthority::new(settings.time_url.clone())),
        Duration::from_millis(settings.clock_probe_timeout_ms),
    ));
    match sync.probe().await {
        Ok(s) => log::info!("clock synced: offset {} ms, rtt {} ms", s.offset_ms, s.rtt_ms),
        Err(e) => log::warn!("initial clock probe failed, running on local time: {e}"),
    }
    tokio::spawn(
        Arc::clone(&sync).run(Duration::from_secs(settings.clock_sync_interval_secs.max(1))),
    );
    let clock = sync.clock();

    // --- bus + pipeline --------------------------------------------------------
    let bus = Arc::new(MarketBus::new());
    spawn_event_logger(&bus);

    let (feed_cmd_tx, feed_cmd_rx) = mpsc::unbounded_channel();
    let mut ticks = TickBuffer::new(settings.tick_buffer_capacity).with_feed_control(feed_cmd_tx);
    for symbol in &symbols {
        let label = symbol.clone();
        ticks.subscribe(
            symbol,
            Box::new(move |tick| {
                metrics::gauge!("last_price", tick.price, "symbol" => label.clone());
            }),
        );
    }

    let slots = settings.strategies.iter().map(StrategySlot::from_spec).collect();
    let mut pipeline = Pipeline::new(
        clock.clone(),
        ticks,
        timeframes.clone(),
        slots,
        Arc::clone(&bus),
    );
    if settings.candle_workers > 0 {
        pipeline = pipeline.with_candle_workers(settings.candle_workers);
    }
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    tokio::spawn(pipeline.run(dispatch_rx));

    // --- scheduler -------------------------------------------------------------
    let scheduler = Arc::new(BoundaryScheduler::with_offset(
        clock.clone(),
        settings.scheduler_offset_ms,
    ));
    for symbol in &symbols {
        for tf in &timeframes {
            let tx = dispatch_tx.clone();
            scheduler.schedule(
                symbol,
                *tf,
                Arc::new(move |fire: BoundaryFire| {
                    if tx.send(DispatchEvent::Boundary(fire)).is_err() {
                        log::debug!("scheduler: pipeline gone, boundary dropped");
                    }
                }),
            );
        }
    }

    // --- feed ------------------------------------------------------------------
    let (feed, feed_state) = BinanceFeed::new(
        FeedConfig {
            url: settings.feed_url.clone(),
            max_retries: settings.feed_max_retries,
            backoff_base_ms: settings.feed_backoff_base_ms,
            backoff_max_ms: settings.feed_backoff_max_ms,
            security: FeedSecurity::from_env(settings.feed_hmac_secret_env.as_deref()),
        },
        Arc::clone(&sync),
        dispatch_tx,
        feed_cmd_rx,
    );
    tokio::spawn(async move {
        if let Err(e) = feed.run().await {
            log::error!("feed stopped: {e}; boundaries keep firing without tick data");
        }
    });

    // --- http ------------------------------------------------------------------
    let state = AppState {
        clock,
        scheduler: Arc::clone(&scheduler),
        feed: feed_state,
    };
    let port = settings.server_port;
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .service(health_scope())
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    scheduler.cancel_all();
    Ok(())
}
