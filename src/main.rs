use chrono::{FixedOffset, Utc};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stockbot::api::{BrokerClient, KisClient, PaperBroker, RateLimitedGateway};
use stockbot::config::{AppConfig, SessionWindow};
use stockbot::db::SqliteStorage;
use stockbot::execution::{
    notify_best_effort, EngineCommand, Executor, LogNotifier, Notification, Notifier,
    PositionManager, PositionSummary, PriceFeedManager,
};
use stockbot::feed::{ConnectionSupervisor, FeedConfig, FeedHandle};
use stockbot::market::MarketConditionGate;
use stockbot::models::{Granularity, History, Tick};
use stockbot::persistence::{FinancialMetricCache, PersistentTickStore};
use stockbot::risk::{FrequencyController, RiskSizer};
use stockbot::strategy::{SignalScorer, TargetSelector};
use stockbot::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const SESSION_CHECK_SECS: u64 = 30;
const FINANCIAL_CLEANUP_EVERY: u32 = 60; // Health checks between cache cleanups

/// Automated equities trading engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/stockbot.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the trading engine (default)
    Run {
        /// Paper-trade against live market data
        #[arg(long)]
        dry_run: bool,
    },
    /// Print store health and a trade-log summary
    Status,
    /// Delete ticks and minute bars older than the horizon
    Cleanup {
        #[arg(long, default_value_t = 30)]
        keep_days: i64,
    },
    /// Dump persisted history for a symbol
    History {
        symbol: String,
        #[arg(long, default_value_t = 1)]
        days: i64,
        #[arg(long, default_value = "minute")]
        granularity: Granularity,
    },
}

// ============================================================================
// Shared State
// ============================================================================

/// Handle of the currently running feed supervisor, replaced on restart
type FeedSlot = Arc<RwLock<Option<FeedHandle>>>;

fn feed_connected(slot: &FeedSlot) -> bool {
    slot.read().as_ref().is_some_and(|h| h.is_connected())
}

fn every(secs: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();
    tracing::info!("Loading configuration from {}", config_path_hint(cli.config.as_deref()));
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run { dry_run: false }) {
        Command::Run { dry_run } => run(config, dry_run).await,
        Command::Status => status(config).await,
        Command::Cleanup { keep_days } => cleanup(config, keep_days).await,
        Command::History {
            symbol,
            days,
            granularity,
        } => history(config, &symbol, days, granularity).await,
    }
}

async fn run(config: AppConfig, dry_run: bool) -> Result<()> {
    config.validate(dry_run)?;
    let session = config.orchestrator.session()?;
    let offset = config.feed.offset();

    tracing::info!(
        "🚀 StockBot starting ({})",
        if dry_run { "dry run" } else { "live" }
    );

    let (broker, gateway) = build_broker(&config, dry_run)?;
    let storage = SqliteStorage::connect(&config.store.db_path).await?;
    let store = Arc::new(PersistentTickStore::start(
        Arc::new(storage.clone()),
        config.store.clone(),
    ));
    let financials = FinancialMetricCache::new(
        storage,
        chrono::Duration::hours(config.store.financial_ttl_hours),
    );
    let health_financials = financials.clone();
    let market = Arc::new(MarketConditionGate::new(broker.clone(), config.market.clone()));
    let opening = market.assess().await;
    tracing::info!("📊 Opening market view: {}", opening.message);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let mut executor = Executor::new(
        broker.clone(),
        market,
        store.clone(),
        notifier.clone(),
        PositionManager::new(config.exits.clone()),
        RiskSizer::new(config.risk.clone(), config.exits.stop_loss_pct),
        FrequencyController::new(config.frequency.clone()),
        SignalScorer::new(config.signal.clone()),
        config.execution.clone(),
    );
    restore_state(&mut executor, &store, broker.as_ref(), config.orchestrator.trade_log_days).await;

    log_configuration(&config, &session);

    let selector = TargetSelector::new(config.selector.clone());
    let held = executor.held_symbols();
    let initial_targets = select_targets(
        broker.as_ref(),
        &selector,
        &financials,
        &held,
        &config.orchestrator.fallback_targets,
    )
    .await;
    tracing::info!("🎯 Initial targets: {}", initial_targets.join(", "));

    // Engine task
    let (tick_tx, tick_rx) = mpsc::channel::<Tick>(config.feed.tick_channel_capacity);
    let (engine_tx, engine_rx) = mpsc::channel::<EngineCommand>(64);
    let engine_shutdown = CancellationToken::new();
    let now_local = Utc::now().with_timezone(&offset);
    for command in [
        EngineCommand::Session(session.is_open(&now_local)),
        EngineCommand::Targets(initial_targets.clone()),
    ] {
        if let Err(e) = engine_tx.send(command).await {
            tracing::error!("Failed to queue startup command: {}", e);
        }
    }
    let mut engine_task = tokio::spawn(executor.run(tick_rx, engine_rx, engine_shutdown.clone()));

    let (targets_tx, targets_rx) = watch::channel(initial_targets);
    let feed_slot: FeedSlot = Arc::new(RwLock::new(None));
    let loops_shutdown = CancellationToken::new();

    tracing::info!("\n🔄 Spawning independent loops...");

    let mut feed_task = {
        let feed_config = config.feed.clone();
        let url = config
            .feed
            .url
            .clone()
            .unwrap_or_else(|| config.broker.ws_url().to_string());
        let broker = broker.clone();
        let targets = targets_rx.clone();
        let ticks = tick_tx.clone();
        let engine = engine_tx.clone();
        let slot = feed_slot.clone();
        let notifier = notifier.clone();
        let exit_on_failure = config.orchestrator.exit_on_feed_failure;
        let shutdown = loops_shutdown.clone();
        tokio::spawn(async move {
            feed_loop(
                feed_config,
                url,
                broker,
                targets,
                ticks,
                engine,
                slot,
                notifier,
                exit_on_failure,
                shutdown,
            )
            .await;
        })
    };

    let loops = vec![
        {
            let broker = broker.clone();
            let engine = engine_tx.clone();
            let fallback = config.orchestrator.fallback_targets.clone();
            let secs = config.orchestrator.target_refresh_secs;
            tokio::spawn(async move {
                target_refresh_loop(
                    broker, selector, financials, engine, targets_tx, fallback, session, offset,
                    secs,
                )
                .await;
            })
        },
        {
            let engine = engine_tx.clone();
            let notifier = notifier.clone();
            let exit_at_end = config.orchestrator.exit_at_session_end;
            tokio::spawn(async move {
                session_loop(session, offset, engine, notifier, exit_at_end).await;
            })
        },
        {
            let store = store.clone();
            let slot = feed_slot.clone();
            let secs = config.orchestrator.health_check_secs;
            tokio::spawn(async move {
                health_check_loop(store, slot, health_financials, gateway, secs).await;
            })
        },
        {
            let broker = broker.clone();
            let slot = feed_slot.clone();
            let targets = targets_rx.clone();
            let ticks = tick_tx.clone();
            let secs = config.orchestrator.poll_interval_secs;
            tokio::spawn(async move {
                polling_fallback_loop(broker, slot, targets, ticks, session, offset, secs).await;
            })
        },
        {
            let engine = engine_tx.clone();
            let store = store.clone();
            let summary_secs = config.orchestrator.summary_secs;
            let housekeeping_secs = config.orchestrator.housekeeping_secs;
            tokio::spawn(async move {
                timer_loop(engine, store, summary_secs, housekeeping_secs).await;
            })
        },
    ];
    drop(tick_tx);

    tracing::info!("✅ All loops spawned successfully");
    notify_best_effort(
        notifier.as_ref(),
        Notification::Started(format!(
            "{} mode, session {}-{}",
            if dry_run { "dry-run" } else { "live" },
            session.start.format("%H:%M"),
            session.end.format("%H:%M")
        )),
    )
    .await;
    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or task failure
    let mut engine_done = false;
    let mut feed_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = &mut engine_task => {
            engine_done = true;
            tracing::error!("Trading engine exited: {:?}", result.as_ref().map(|_| ()));
        }
        result = &mut feed_task => {
            feed_done = true;
            tracing::error!("Feed loop exited: {:?}", result);
        }
    }

    // Feed first so no new ticks arrive, then the engine, then the store
    loops_shutdown.cancel();
    for task in &loops {
        task.abort();
    }
    if !feed_done {
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut feed_task).await;
    }

    engine_shutdown.cancel();
    let summary = if engine_done {
        None
    } else {
        match engine_task.await {
            Ok(executor) => Some(executor.summary()),
            Err(e) => {
                tracing::error!("Trading engine task failed: {}", e);
                None
            }
        }
    };

    store.shutdown().await;

    let message = summary
        .map(|s| describe_summary(&s))
        .unwrap_or_else(|| "engine state unavailable".to_string());
    notify_best_effort(notifier.as_ref(), Notification::Stopped(message)).await;
    tracing::info!("👋 StockBot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stockbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The trading broker and, when credentials are configured, the rate-limited
/// KIS gateway behind it. Live mode trades through the gateway; dry runs fill
/// on paper, quoting from the gateway when there is one.
fn build_broker(
    config: &AppConfig,
    dry_run: bool,
) -> Result<(Arc<dyn BrokerClient>, Option<Arc<RateLimitedGateway>>)> {
    let has_credentials = !config.broker.app_key.trim().is_empty();

    let gateway = if has_credentials {
        let kis: Arc<dyn BrokerClient> = Arc::new(KisClient::new(config.broker.clone())?);
        Some(Arc::new(RateLimitedGateway::new(kis, config.gateway.clone())))
    } else {
        None
    };

    let broker: Arc<dyn BrokerClient> = match (dry_run, gateway.clone()) {
        (false, Some(live)) => live as Arc<dyn BrokerClient>,
        (false, None) => return Err("live trading requires broker credentials".into()),
        (true, Some(live)) => Arc::new(PaperBroker::with_upstream(
            config.risk.initial_balance,
            live,
        )),
        (true, None) => {
            tracing::warn!("Dry run without credentials: no market data will be available");
            Arc::new(PaperBroker::new(config.risk.initial_balance))
        }
    };
    Ok((broker, gateway))
}

/// Prime risk statistics from the trade log and adopt broker holdings
async fn restore_state(
    executor: &mut Executor,
    store: &PersistentTickStore,
    broker: &dyn BrokerClient,
    trade_log_days: i64,
) {
    match store.load_recent_trades(trade_log_days).await {
        Ok(trades) => {
            tracing::info!("✓ Loaded {} trades from the last {} days", trades.len(), trade_log_days);
            executor.prime_risk(trades);
        }
        Err(e) => tracing::warn!("Failed to load trade log: {}", e),
    }

    match broker.get_balance().await {
        Ok(balance) => {
            tracing::info!(
                "✓ Balance: {:.0} cash, {} holdings",
                balance.cash_available,
                balance.holdings.len()
            );
            executor.adopt_holdings(&balance);
        }
        Err(e) => tracing::warn!("Failed to fetch balance, starting flat: {}", e),
    }
}

fn log_configuration(config: &AppConfig, session: &SessionWindow) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!(
        "  Session: {} - {}",
        session.start.format("%H:%M"),
        session.end.format("%H:%M")
    );
    tracing::info!("  Max positions: {}", config.execution.max_positions);
    tracing::info!(
        "  Stop loss / take profit: {:.1}% / {:.1}%",
        config.exits.stop_loss_pct * 100.0,
        config.exits.take_profit_pct * 100.0
    );
    tracing::info!("  Max daily loss: {:.1}%", config.risk.max_daily_loss_pct * 100.0);
    tracing::info!("  Min signal score: {}", config.signal.min_signal_score);
    tracing::info!("  Store: {}", config.store.db_path);
}

// ============================================================================
// Target Selection
// ============================================================================

async fn select_targets(
    broker: &dyn BrokerClient,
    selector: &TargetSelector,
    financials: &FinancialMetricCache,
    held: &[String],
    fallback: &[String],
) -> Vec<String> {
    let targets = match broker.get_volume_ranking().await {
        Ok(ranking) if !ranking.is_empty() => selector.select(&ranking, held),
        Ok(_) => {
            tracing::warn!("Empty volume ranking, using fallback targets");
            with_held(fallback, held)
        }
        Err(e) => {
            tracing::warn!("Volume ranking unavailable ({}), using fallback targets", e);
            with_held(fallback, held)
        }
    };

    for symbol in &targets {
        match financials.fetch_through(broker, symbol).await {
            Ok(Some(ratios)) => tracing::debug!(
                "  {} PER {} PBR {}",
                symbol,
                ratios.per.map_or("n/a".to_string(), |v| format!("{:.1}", v)),
                ratios.pbr.map_or("n/a".to_string(), |v| format!("{:.2}", v))
            ),
            Ok(None) => tracing::debug!("  {} has no financial ratios", symbol),
            Err(e) => tracing::warn!("  ✗ Financial cache error for {}: {}", symbol, e),
        }
    }

    targets
}

fn with_held(base: &[String], held: &[String]) -> Vec<String> {
    let mut targets = base.to_vec();
    for symbol in held {
        if !targets.contains(symbol) {
            targets.push(symbol.clone());
        }
    }
    targets
}

async fn request_summary(engine: &mpsc::Sender<EngineCommand>) -> Option<PositionSummary> {
    let (reply, rx) = oneshot::channel();
    engine.send(EngineCommand::Summary(reply)).await.ok()?;
    rx.await.ok()
}

fn describe_summary(summary: &PositionSummary) -> String {
    format!(
        "{} open positions, unrealized {:+.0}, realized today {:+.0}, balance {:.0}",
        summary.positions.len(),
        summary.unrealized_pnl,
        summary.daily_realized_pnl,
        summary.balance
    )
}

// ============================================================================
// Loops
// ============================================================================

/// Outer restart loop around the bounded reconnecting supervisor
#[allow(clippy::too_many_arguments)]
async fn feed_loop(
    config: FeedConfig,
    url: String,
    broker: Arc<dyn BrokerClient>,
    mut targets: watch::Receiver<Vec<String>>,
    ticks: mpsc::Sender<Tick>,
    engine: mpsc::Sender<EngineCommand>,
    slot: FeedSlot,
    notifier: Arc<dyn Notifier>,
    exit_on_failure: bool,
    shutdown: CancellationToken,
) {
    tracing::info!("📡 Feed loop starting ({})", url);
    let cooldown = Duration::from_secs(config.restart_cooldown_secs);

    loop {
        let approval_key = match broker.stream_approval_key().await {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("Failed to obtain stream approval key: {}", e);
                if cancelled_during(&shutdown, cooldown).await {
                    return;
                }
                continue;
            }
        };

        let symbols = targets.borrow_and_update().clone();
        let (supervisor, handle) =
            ConnectionSupervisor::new(config.clone(), url.clone(), approval_key, symbols, ticks.clone());
        *slot.write() = Some(handle.clone());
        let mut running = tokio::spawn(supervisor.run());

        let mut targets_open = true;
        let failure = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    handle.shutdown();
                    let _ = running.await;
                    *slot.write() = None;
                    return;
                }
                changed = targets.changed(), if targets_open => match changed {
                    Ok(()) => {
                        let symbols = targets.borrow_and_update().clone();
                        if !handle.set_targets(symbols).await {
                            tracing::warn!("Feed supervisor gone, target update dropped");
                        }
                    }
                    Err(_) => targets_open = false,
                },
                result = &mut running => {
                    break match result {
                        Ok(Ok(())) => return,
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("feed task panicked: {}", e),
                    };
                }
            }
        };

        *slot.write() = None;
        tracing::error!("❌ Realtime feed failed: {}", failure);
        notify_best_effort(
            notifier.as_ref(),
            Notification::Error(format!("realtime feed failed: {}", failure)),
        )
        .await;

        if exit_on_failure
            && engine
                .send(EngineCommand::EmergencyExit("feed_failure".to_string()))
                .await
                .is_err()
        {
            tracing::warn!("Trading engine gone, emergency exit for feed failure not delivered");
        }

        tracing::info!("Restarting feed in {:?}", cooldown);
        if cancelled_during(&shutdown, cooldown).await {
            return;
        }
    }
}

/// Sleep unless cancelled first; true when cancelled
async fn cancelled_during(shutdown: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn target_refresh_loop(
    broker: Arc<dyn BrokerClient>,
    selector: TargetSelector,
    financials: FinancialMetricCache,
    engine: mpsc::Sender<EngineCommand>,
    targets: watch::Sender<Vec<String>>,
    fallback: Vec<String>,
    session: SessionWindow,
    offset: FixedOffset,
    secs: u64,
) {
    tracing::info!("🎯 Target refresh loop starting (every {}s)", secs);
    let mut ticker = every(secs);
    ticker.tick().await; // Initial targets were selected at startup

    loop {
        ticker.tick().await;
        if !session.is_open(&Utc::now().with_timezone(&offset)) {
            continue;
        }

        let held: Vec<String> = request_summary(&engine)
            .await
            .map(|s| s.positions.into_iter().map(|p| p.symbol).collect())
            .unwrap_or_default();

        let selected =
            select_targets(broker.as_ref(), &selector, &financials, &held, &fallback).await;
        if selected == *targets.borrow() {
            tracing::debug!("Targets unchanged ({})", selected.len());
            continue;
        }

        tracing::info!("🎯 Targets updated: {}", selected.join(", "));
        if engine
            .send(EngineCommand::Targets(selected.clone()))
            .await
            .is_err()
        {
            tracing::error!("Trading engine gone, stopping target refresh");
            return;
        }
        targets.send_replace(selected);
    }
}

/// Opens and closes entries at the session boundaries
async fn session_loop(
    session: SessionWindow,
    offset: FixedOffset,
    engine: mpsc::Sender<EngineCommand>,
    notifier: Arc<dyn Notifier>,
    exit_at_end: bool,
) {
    let mut ticker = every(SESSION_CHECK_SECS);
    let mut was_open = session.is_open(&Utc::now().with_timezone(&offset));

    loop {
        ticker.tick().await;
        let open = session.is_open(&Utc::now().with_timezone(&offset));
        if open == was_open {
            continue;
        }
        was_open = open;

        if engine.send(EngineCommand::Session(open)).await.is_err() {
            tracing::error!("Trading engine gone, stopping session loop");
            return;
        }

        if open {
            tracing::info!("🔔 Session open");
            continue;
        }

        tracing::info!("🔕 Session closed");
        if exit_at_end
            && engine
                .send(EngineCommand::EmergencyExit("session_end".to_string()))
                .await
                .is_err()
        {
            tracing::error!("Trading engine gone, stopping session loop");
            return;
        }
        if let Some(summary) = request_summary(&engine).await {
            notify_best_effort(
                notifier.as_ref(),
                Notification::Stopped(format!("session closed: {}", describe_summary(&summary))),
            )
            .await;
        }
    }
}

/// Store health; a dead or wedged worker is replaced
async fn health_check_loop(
    store: Arc<PersistentTickStore>,
    feed: FeedSlot,
    financials: FinancialMetricCache,
    gateway: Option<Arc<RateLimitedGateway>>,
    secs: u64,
) {
    tracing::info!("🩺 Health check loop starting (every {}s)", secs);
    let mut ticker = every(secs);
    let mut checks = 0u32;

    loop {
        ticker.tick().await;
        checks += 1;

        let health = store.health();
        if !health.is_healthy() {
            tracing::warn!(
                worker_alive = health.worker_alive,
                queue_depth_ok = health.queue_depth_ok,
                recent_write_ok = health.recent_write_ok,
                low_failure_rate = health.low_failure_rate,
                "Tick store unhealthy, recovering"
            );
            store.recover();
        }

        match feed.read().as_ref() {
            Some(handle) if !handle.is_connected() => {
                tracing::warn!("Realtime feed is {:?}", handle.state())
            }
            None => tracing::warn!("Realtime feed not running"),
            _ => {}
        }

        if let Some(gateway) = &gateway {
            let cache = gateway.cache();
            let expired = cache.clear_expired();
            let stats = cache.stats();
            tracing::debug!(
                hits = stats.hits,
                misses = stats.misses,
                entries = stats.entries,
                expired,
                "Response cache"
            );
        }

        if checks % FINANCIAL_CLEANUP_EVERY == 0 {
            if let Err(e) = financials.cleanup_expired().await {
                tracing::warn!("Financial cache cleanup failed: {}", e);
            }
        }
    }
}

/// Polls quotes into the tick path while the realtime feed is down
async fn polling_fallback_loop(
    broker: Arc<dyn BrokerClient>,
    feed: FeedSlot,
    targets: watch::Receiver<Vec<String>>,
    ticks: mpsc::Sender<Tick>,
    session: SessionWindow,
    offset: FixedOffset,
    secs: u64,
) {
    let mut poller = PriceFeedManager::new(broker);
    let mut ticker = every(secs);

    loop {
        ticker.tick().await;
        if feed_connected(&feed) || !session.is_open(&Utc::now().with_timezone(&offset)) {
            continue;
        }

        let symbols = targets.borrow().clone();
        if symbols.is_empty() {
            continue;
        }

        tracing::debug!("Feed down, polling {} quotes", symbols.len());
        for tick in poller.fetch_all(&symbols).await {
            if ticks.send(tick).await.is_err() {
                return;
            }
        }
    }
}

/// Position summaries and time-based exit housekeeping
async fn timer_loop(
    engine: mpsc::Sender<EngineCommand>,
    store: Arc<PersistentTickStore>,
    summary_secs: u64,
    housekeeping_secs: u64,
) {
    let mut summary = every(summary_secs);
    let mut housekeeping = every(housekeeping_secs);

    loop {
        let command = tokio::select! {
            _ = summary.tick() => {
                let stats = store.stats().await;
                tracing::info!(
                    "💾 Store: {} queued, {} saved, {} dropped, {} failed writes",
                    stats.queue_depth,
                    stats.saved,
                    stats.dropped,
                    stats.failed_writes
                );
                EngineCommand::LogSummary
            }
            _ = housekeeping.tick() => EngineCommand::Housekeeping,
        };

        if engine.send(command).await.is_err() {
            tracing::error!("Trading engine gone, stopping timers");
            return;
        }
    }
}

// ============================================================================
// Maintenance Commands
// ============================================================================

async fn open_store(config: &AppConfig) -> Result<(SqliteStorage, PersistentTickStore)> {
    let storage = SqliteStorage::connect(&config.store.db_path).await?;
    let store = PersistentTickStore::start(Arc::new(storage.clone()), config.store.clone());
    Ok((storage, store))
}

async fn status(config: AppConfig) -> Result<()> {
    let (_, store) = open_store(&config).await?;

    let stats = store.stats().await;
    let health = store.health();
    println!("Store: {}", config.store.db_path);
    println!("  healthy:        {}", health.is_healthy());
    println!("  ticks:          {}", stats.rows.ticks);
    println!("  minute bars:    {}", stats.rows.minute_bars);
    println!("  trades:         {}", stats.rows.trades);
    println!("  fin. metrics:   {}", stats.rows.financial_metrics);

    let days = config.orchestrator.trade_log_days;
    let trades = store.load_recent_trades(days).await?;
    let sells: Vec<_> = trades.iter().filter(|t| t.is_sell()).collect();
    let wins = sells.iter().filter(|t| t.pnl() > 0.0).count();
    let realized: f64 = sells.iter().map(|t| t.pnl()).sum();

    println!("Trade log (last {} days):", days);
    println!("  buys:           {}", trades.len() - sells.len());
    println!("  sells:          {}", sells.len());
    if !sells.is_empty() {
        println!(
            "  win rate:       {:.1}%",
            wins as f64 / sells.len() as f64 * 100.0
        );
    }
    println!("  realized pnl:   {:+.0}", realized);
    for trade in trades.iter().rev().take(10) {
        println!(
            "  {} {:<4} {} x{} @ {:.0} ({})",
            trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
            trade.action.as_str(),
            trade.symbol,
            trade.quantity,
            trade.price,
            trade.reason
        );
    }

    store.shutdown().await;
    Ok(())
}

async fn cleanup(config: AppConfig, keep_days: i64) -> Result<()> {
    let (storage, store) = open_store(&config).await?;

    let removed = store.cleanup_old(keep_days).await?;
    let financials = FinancialMetricCache::new(
        storage,
        chrono::Duration::hours(config.store.financial_ttl_hours),
    );
    let expired = financials.cleanup_expired().await?;

    println!(
        "🧹 Removed {} tick/minute rows older than {} days and {} expired financial metrics",
        removed, keep_days, expired
    );
    store.shutdown().await;
    Ok(())
}

async fn history(
    config: AppConfig,
    symbol: &str,
    days: i64,
    granularity: Granularity,
) -> Result<()> {
    let (_, store) = open_store(&config).await?;

    match store.load_history(symbol, days, granularity).await? {
        History::Ticks(ticks) => {
            for t in &ticks {
                println!(
                    "{} {} {:.0} {}",
                    t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    t.symbol,
                    t.price,
                    t.volume
                );
            }
            println!("{} ticks", ticks.len());
        }
        History::Bars(bars) => {
            for b in &bars {
                println!(
                    "{} {} O {:.0} H {:.0} L {:.0} C {:.0} V {} RSI {}",
                    b.timestamp.format("%Y-%m-%d %H:%M"),
                    b.symbol,
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.volume,
                    b.rsi.map_or("-".to_string(), |v| format!("{:.1}", v))
                );
            }
            println!("{} minute bars", bars.len());
        }
    }

    store.shutdown().await;
    Ok(())
}

fn config_path_hint(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| stockbot::config::DEFAULT_CONFIG_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockbot::persistence::StoreConfig;

    #[tokio::test]
    async fn test_timer_loop_stops_when_engine_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::connect(dir.path().join("timers.db"))
            .await
            .unwrap();
        let store = Arc::new(PersistentTickStore::start(
            Arc::new(storage),
            StoreConfig::default(),
        ));

        let (engine, commands) = mpsc::channel(1);
        drop(commands);
        tokio::time::timeout(Duration::from_secs(5), timer_loop(engine, store.clone(), 1, 1))
            .await
            .expect("timer loop returns once the engine channel closes");
        store.shutdown().await;
    }
}
