use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::notifier::{notify_best_effort, Notification, Notifier};
use super::position_manager::{ExitReason, PositionManager, PositionStatus};
use super::rolling_store::{RollingSeriesStore, SeriesField};
use crate::api::{BrokerClient, GatewayError, GatewayResult};
use crate::market::MarketConditionGate;
use crate::models::{Balance, OrderAck, OrderPrice, OrderSide, Tick, TradeRecord};
use crate::persistence::{MinuteAggregator, PersistentTickStore};
use crate::risk::{FrequencyController, RiskSizer};
use crate::strategy::SignalScorer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_positions: usize,
    pub exit_attempts: u32,
    pub exit_backoff_ms: u64,
    pub order_timeout_secs: u64,
    /// Dropped targets are only sold above this pnl %
    pub target_removed_min_pnl_pct: f64,
    pub sell_signal_min_points: u8,
    pub sell_signal_min_pnl_pct: f64,
    pub window_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_positions: 5,
            exit_attempts: 3,
            exit_backoff_ms: 500,
            order_timeout_secs: 5,
            target_removed_min_pnl_pct: 1.0,
            sell_signal_min_points: 3,
            sell_signal_min_pnl_pct: 0.5,
            window_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Buy { quantity: u64 },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// One open position as seen from outside the engine
#[derive(Debug, Clone, PartialEq)]
pub struct PositionView {
    pub symbol: String,
    pub quantity: u64,
    pub entry_price: f64,
    pub current_price: f64,
    pub pnl_pct: f64,
    pub unrealized_pnl: f64,
    pub status: PositionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSummary {
    pub positions: Vec<PositionView>,
    pub unrealized_pnl: f64,
    pub daily_realized_pnl: f64,
    pub balance: f64,
    pub consecutive_losses: u32,
    pub daily_buys: u32,
}

/// Requests from the orchestrator to the engine task
#[derive(Debug)]
pub enum EngineCommand {
    /// New watch list; positions dropped from it may be sold
    Targets(Vec<String>),
    /// Inside/outside the trading session
    Session(bool),
    EmergencyExit(String),
    /// Time-based exit checks and retry of queued exits
    Housekeeping,
    LogSummary,
    Summary(oneshot::Sender<PositionSummary>),
}

/// The trading engine.
///
/// Owns every piece of per-symbol state (rolling windows, open positions,
/// risk and frequency bookkeeping), so position transitions for a symbol
/// are serialized by construction.
pub struct Executor {
    broker: Arc<dyn BrokerClient>,
    market: Arc<MarketConditionGate>,
    store: Arc<PersistentTickStore>,
    notifier: Arc<dyn Notifier>,
    positions: PositionManager,
    sizer: RiskSizer,
    frequency: FrequencyController,
    scorer: SignalScorer,
    series: RollingSeriesStore,
    aggregator: MinuteAggregator,
    config: ExecutionConfig,
    entries_enabled: bool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        market: Arc<MarketConditionGate>,
        store: Arc<PersistentTickStore>,
        notifier: Arc<dyn Notifier>,
        positions: PositionManager,
        sizer: RiskSizer,
        frequency: FrequencyController,
        scorer: SignalScorer,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            broker,
            market,
            store,
            notifier,
            positions,
            sizer,
            frequency,
            scorer,
            series: RollingSeriesStore::new(config.window_capacity),
            aggregator: MinuteAggregator::new(),
            config,
            entries_enabled: true,
        }
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn series(&self) -> &RollingSeriesStore {
        &self.series
    }

    pub fn sizer(&self) -> &RiskSizer {
        &self.sizer
    }

    pub fn frequency(&self) -> &FrequencyController {
        &self.frequency
    }

    pub fn set_entries_enabled(&mut self, enabled: bool) {
        if enabled != self.entries_enabled {
            tracing::info!(
                "{}",
                if enabled {
                    "🔔 Trading session open: entries enabled"
                } else {
                    "🔕 Outside trading session: entries disabled"
                }
            );
        }
        self.entries_enabled = enabled;
    }

    pub fn held_symbols(&self) -> Vec<String> {
        let mut symbols = self.positions.symbols();
        symbols.sort();
        symbols
    }

    /// Restore risk statistics from the persisted trade log
    pub fn prime_risk(&mut self, history: Vec<TradeRecord>) {
        self.sizer.prime(history);
    }

    /// Track holdings the broker reports at startup
    pub fn adopt_holdings(&mut self, balance: &Balance) -> usize {
        let mut adopted = 0;
        for holding in balance.holdings.iter().filter(|h| h.quantity > 0) {
            match self
                .positions
                .adopt(&holding.symbol, holding.avg_price, holding.quantity)
            {
                Ok(_) => adopted += 1,
                Err(e) => tracing::warn!("Cannot adopt {}: {}", holding.symbol, e),
            }
        }
        if adopted > 0 {
            tracing::info!("Adopted {} existing holdings", adopted);
        }
        adopted
    }

    // ------------------------------------------------------------------
    // Tick path
    // ------------------------------------------------------------------

    /// Apply one tick: ingest, then either manage the open position or
    /// evaluate an entry. Returns the entry decision when one was evaluated.
    pub async fn on_tick(&mut self, tick: Tick) -> Option<ExecutionDecision> {
        if tick.price.is_nan() || tick.price <= 0.0 {
            tracing::debug!("Dropping tick with bad price for {}", tick.symbol);
            return None;
        }

        self.ingest(&tick);

        if self.positions.has_open_position(&tick.symbol) {
            self.positions
                .on_price_at(&tick.symbol, tick.price, tick.timestamp);
            self.check_sell_signal(&tick.symbol);
            self.process_exits().await;
            return None;
        }

        let decision = self.evaluate_entry(&tick.symbol, tick.price).await;
        match decision.action {
            ExecutionAction::Buy { quantity } => {
                self.buy(&tick.symbol, tick.price, quantity, &decision.reason, tick.timestamp)
                    .await;
            }
            ExecutionAction::Skip => {
                tracing::debug!("{} entry skipped: {}", tick.symbol, decision.reason);
            }
        }
        Some(decision)
    }

    fn ingest(&mut self, tick: &Tick) {
        let recent = self
            .series
            .recent(&tick.symbol, SeriesField::Price, Some(20));
        if let Some(bar) = self.aggregator.on_tick(tick, &recent) {
            self.store.finalize_minute(bar);
        }
        self.series
            .record_tick(&tick.symbol, tick.price, tick.volume as f64, tick.timestamp);
        self.store.enqueue_tick(tick.clone());
    }

    /// Entry gates in order: position/session limits, risk, frequency,
    /// market condition, signal, then size. The first veto wins.
    pub async fn evaluate_entry(&mut self, symbol: &str, price: f64) -> ExecutionDecision {
        if self.positions.has_open_position(symbol) {
            return ExecutionDecision::skip("already holding a position");
        }
        if !self.entries_enabled {
            return ExecutionDecision::skip("outside trading session");
        }
        if self.positions.len() >= self.config.max_positions {
            return ExecutionDecision::skip(format!(
                "max positions reached ({}/{})",
                self.positions.len(),
                self.config.max_positions
            ));
        }

        if let Err(trip) = self.sizer.can_trade() {
            return ExecutionDecision::skip(format!("risk: {}", trip));
        }

        let quantity = match self.sizer.size_position(price) {
            Ok(q) => q,
            Err(e) => return ExecutionDecision::skip(e.to_string()),
        };

        let verdict = self.frequency.can_buy(symbol, price, quantity.max(1));
        if !verdict.allowed {
            return ExecutionDecision::skip(format!("frequency: {}", verdict.reason));
        }

        let market = self.market.latest();
        let prices = self.series.recent(symbol, SeriesField::Price, None);
        let volumes = self.series.recent(symbol, SeriesField::Volume, None);
        let signal = self.scorer.should_buy(&prices, &volumes, market.condition);
        if !signal.approved {
            return ExecutionDecision::skip(format!("signal: {}", signal.reason));
        }

        if quantity == 0 {
            return ExecutionDecision::skip("risk: position size is zero");
        }

        ExecutionDecision {
            action: ExecutionAction::Buy { quantity },
            reason: signal.reason,
        }
    }

    async fn submit(&self, symbol: &str, side: OrderSide, quantity: u64) -> GatewayResult<OrderAck> {
        let limit = Duration::from_secs(self.config.order_timeout_secs);
        timeout(
            limit,
            self.broker
                .place_order(symbol, side, quantity, OrderPrice::Market),
        )
        .await
        .unwrap_or(Err(GatewayError::Timeout(limit)))
    }

    /// Submit a market buy and open the position on acceptance
    pub async fn buy(
        &mut self,
        symbol: &str,
        price: f64,
        quantity: u64,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let ack = match self.submit(symbol, OrderSide::Buy, quantity).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("❌ Buy {} x{} failed: {}", symbol, quantity, e);
                return false;
            }
        };
        let price = ack.fill_price.unwrap_or(price);

        if let Err(e) = self
            .positions
            .open_position_at(symbol, price, quantity, Some(timestamp))
        {
            tracing::error!("Buy {} accepted ({:?}) but not tracked: {}", symbol, ack.order_id, e);
            return false;
        }

        self.frequency.record_buy(symbol);
        self.store
            .record_trade(TradeRecord::buy(symbol, price, quantity, timestamp, reason));
        notify_best_effort(
            self.notifier.as_ref(),
            Notification::PositionOpened {
                symbol: symbol.to_string(),
                quantity,
                price,
                reason: reason.to_string(),
            },
        )
        .await;
        true
    }

    fn check_sell_signal(&mut self, symbol: &str) {
        let Some(position) = self.positions.get(symbol) else {
            return;
        };
        if !position.is_active() || position.pnl_pct() < self.config.sell_signal_min_pnl_pct {
            return;
        }

        let prices = self.series.recent(symbol, SeriesField::Price, None);
        let volumes = self.series.recent(symbol, SeriesField::Volume, None);
        let sell = self.scorer.score_sell(&prices, &volumes);
        if sell.points >= self.config.sell_signal_min_points {
            tracing::info!(
                "{} sell signal {} points: {}",
                symbol,
                sell.points,
                sell.reasons.join(", ")
            );
            self.positions.queue_exit(symbol, ExitReason::SellSignal);
        }
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    /// Try every queued exit; returns how many closed
    pub async fn process_exits(&mut self) -> usize {
        let mut closed = 0;
        for (symbol, reason) in self.positions.pending_exits() {
            if self.execute_exit(&symbol, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Sell with bounded retries. On failure the exit stays queued.
    async fn execute_exit(&mut self, symbol: &str, reason: ExitReason) -> bool {
        let Some(position) = self.positions.get(symbol) else {
            return false;
        };
        let (quantity, entry, price) = (
            position.quantity,
            position.avg_entry_price,
            position.current_price,
        );

        let attempts = self.config.exit_attempts.max(1);
        for attempt in 1..=attempts {
            match self.submit(symbol, OrderSide::Sell, quantity).await {
                Ok(ack) => {
                    let fill = ack.fill_price.unwrap_or(price);
                    self.finish_exit(symbol, entry, fill, quantity).await;
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Sell {} x{} ({}) failed (attempt {}/{}): {}",
                        symbol,
                        quantity,
                        reason,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.exit_backoff_ms))
                            .await;
                    }
                }
            }
        }

        self.positions.exit_failed(symbol);
        false
    }

    /// Close the position at `price`, the broker's fill when reported and
    /// otherwise the last tick
    async fn finish_exit(&mut self, symbol: &str, entry: f64, price: f64, quantity: u64) {
        let assessment = self.frequency.can_sell(price, entry, quantity).reason;
        let record = match self.positions.complete_exit_at(symbol, price, Some(Utc::now())) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Sell {} filled but position not closed: {}", symbol, e);
                return;
            }
        };

        self.store.record_trade(record.clone());
        self.sizer.record_trade(&record);
        self.frequency.record_sell(symbol, entry, price, quantity);

        notify_best_effort(
            self.notifier.as_ref(),
            Notification::PositionClosed {
                symbol: symbol.to_string(),
                quantity,
                price,
                reason: record.reason.clone(),
                pnl: record.pnl(),
                pnl_pct: record.realized_pnl_pct.unwrap_or(0.0),
                assessment,
            },
        )
        .await;
    }

    /// Positions no longer watched are sold when comfortably profitable
    pub async fn on_targets_changed(&mut self, targets: &[String]) -> usize {
        let dropped: Vec<String> = self
            .positions
            .positions()
            .filter(|p| p.is_active() && !targets.contains(&p.symbol))
            .filter(|p| p.pnl_pct() > self.config.target_removed_min_pnl_pct)
            .map(|p| p.symbol.clone())
            .collect();

        for symbol in &dropped {
            self.positions.queue_exit(symbol, ExitReason::TargetRemoved);
        }
        if dropped.is_empty() {
            0
        } else {
            self.process_exits().await
        }
    }

    pub async fn emergency_exit_all(&mut self, why: &str) -> usize {
        let queued = self.positions.queue_emergency_exit_all(why);
        if queued.is_empty() {
            return 0;
        }
        notify_best_effort(
            self.notifier.as_ref(),
            Notification::Error(format!("emergency exit of {} positions: {}", queued.len(), why)),
        )
        .await;
        self.process_exits().await
    }

    /// Time-based exit checks for symbols without fresh ticks, then retry
    /// whatever is still queued
    pub async fn housekeeping(&mut self, now: DateTime<Utc>) -> usize {
        for symbol in self.positions.symbols() {
            if let Some(price) = self.positions.get(&symbol).map(|p| p.current_price) {
                self.positions.on_price_at(&symbol, price, now);
            }
        }
        self.process_exits().await
    }

    /// Close every in-progress minute bar into the store
    pub fn flush_bars(&mut self) -> usize {
        let series = &self.series;
        let bars = self
            .aggregator
            .flush_all(|symbol| series.recent(symbol, SeriesField::Price, Some(20)));
        let count = bars.len();
        for bar in bars {
            self.store.finalize_minute(bar);
        }
        count
    }

    pub fn summary(&self) -> PositionSummary {
        let mut positions: Vec<PositionView> = self
            .positions
            .positions()
            .map(|p| PositionView {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                entry_price: p.avg_entry_price,
                current_price: p.current_price,
                pnl_pct: p.pnl_pct(),
                unrealized_pnl: p.unrealized_pnl(),
                status: p.status,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let state = self.sizer.state();
        PositionSummary {
            unrealized_pnl: positions.iter().map(|p| p.unrealized_pnl).sum(),
            positions,
            daily_realized_pnl: state.daily_realized_pnl,
            balance: state.current_balance,
            consecutive_losses: state.consecutive_losses,
            daily_buys: self.frequency.daily_buys(),
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            "📊 {} positions, unrealized {:+.0}, realized today {:+.0}, balance {:.0}, losses in a row {}, buys today {}",
            summary.positions.len(),
            summary.unrealized_pnl,
            summary.daily_realized_pnl,
            summary.balance,
            summary.consecutive_losses,
            summary.daily_buys
        );
        for p in &summary.positions {
            tracing::info!(
                "   {} x{} @ {:.0} -> {:.0} ({:+.2}%, {:+.0}) {:?}",
                p.symbol,
                p.quantity,
                p.entry_price,
                p.current_price,
                p.pnl_pct,
                p.unrealized_pnl,
                p.status
            );
        }
    }

    // ------------------------------------------------------------------
    // Engine task
    // ------------------------------------------------------------------

    /// Consume ticks and orchestrator commands until shutdown. Open minute
    /// bars are flushed before returning.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<Tick>,
        mut commands: mpsc::Receiver<EngineCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        tracing::info!("⚙️  Trading engine started");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                Some(command) = commands.recv() => self.handle_command(command).await,

                Some(tick) = ticks.recv() => {
                    self.on_tick(tick).await;
                }

                else => break,
            }
        }

        // Drain ticks that already arrived
        while let Ok(tick) = ticks.try_recv() {
            self.ingest(&tick);
        }
        let flushed = self.flush_bars();
        tracing::info!("⚙️  Trading engine stopped ({} bars flushed)", flushed);
        self
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Targets(targets) => {
                let sold = self.on_targets_changed(&targets).await;
                if sold > 0 {
                    tracing::info!("Sold {} positions dropped from targets", sold);
                }
            }
            EngineCommand::Session(open) => self.set_entries_enabled(open),
            EngineCommand::EmergencyExit(why) => {
                self.emergency_exit_all(&why).await;
            }
            EngineCommand::Housekeeping => {
                self.housekeeping(Utc::now()).await;
            }
            EngineCommand::LogSummary => self.log_summary(),
            EngineCommand::Summary(reply) => {
                let _ = reply.send(self.summary());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::db::SqliteStorage;
    use crate::execution::notifier::tests::RecordingNotifier;
    use crate::execution::ExitRules;
    use crate::market::MarketConfig;
    use crate::models::TradeAction;
    use crate::persistence::StoreConfig;
    use crate::risk::{FrequencyConfig, RiskConfig};
    use crate::strategy::SignalConfig;
    use chrono::{Duration as ChronoDuration, TimeZone};

    struct Harness {
        executor: Executor,
        paper: Arc<PaperBroker>,
        storage: SqliteStorage,
        store: Arc<PersistentTickStore>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap()
    }

    async fn harness(config: ExecutionConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::connect(dir.path().join("engine.db"))
            .await
            .unwrap();
        let store = Arc::new(PersistentTickStore::start(
            Arc::new(storage.clone()),
            StoreConfig::default(),
        ));

        let paper = Arc::new(PaperBroker::new(10_000_000.0));
        paper.set_index("0001", 2_650.0, 0.2);
        paper.set_index("1001", 850.0, 0.1);

        let market_config = MarketConfig {
            max_attempts: 1,
            ..Default::default()
        };
        let market = Arc::new(MarketConditionGate::new(paper.clone(), market_config));
        let notifier = Arc::new(RecordingNotifier::default());
        let rules = ExitRules::default();
        let sizer = RiskSizer::new(RiskConfig::default(), rules.stop_loss_pct);

        let executor = Executor::new(
            paper.clone(),
            market,
            store.clone(),
            notifier.clone(),
            PositionManager::new(rules),
            sizer,
            FrequencyController::new(FrequencyConfig::default()),
            SignalScorer::new(SignalConfig::default()),
            config,
        );

        Harness {
            executor,
            paper,
            storage,
            store,
            notifier,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_stop_loss_tick_sells_and_logs_trade() {
        let mut h = harness(ExecutionConfig::default()).await;
        h.paper.set_price("005930", 10_000.0);
        assert!(h.executor.buy("005930", 10_000.0, 7, "test entry", t0()).await);

        h.paper.set_price("005930", 9_790.0);
        let decision = h
            .executor
            .on_tick(Tick::new("005930", 9_790.0, 3, t0() + ChronoDuration::minutes(1)))
            .await;

        assert!(decision.is_none());
        assert!(!h.executor.positions().has_open_position("005930"));
        assert_eq!(h.executor.sizer().state().consecutive_losses, 1);

        h.store.shutdown().await;
        let trades = h.storage.load_trades(t0() - ChronoDuration::days(1)).await.unwrap();
        assert_eq!(trades.len(), 2);
        let sell = trades.iter().find(|t| t.action == TradeAction::Sell).unwrap();
        assert_eq!(sell.reason, "stop_loss");
        assert_eq!(sell.pnl(), (9_790.0 - 10_000.0) * 7.0);

        let events = h.notifier.events.lock();
        assert!(matches!(events[0], Notification::PositionOpened { .. }));
        assert!(matches!(events[1], Notification::PositionClosed { .. }));
    }

    #[tokio::test]
    async fn test_exit_uses_broker_fill_and_reports_fee_view() {
        let mut h = harness(ExecutionConfig::default()).await;
        h.paper.set_price("005930", 10_000.0);
        assert!(h.executor.buy("005930", 10_000.0, 10, "test entry", t0()).await);

        // Take-profit fires on the tick, the broker fills a little higher
        h.paper.set_price("005930", 10_400.0);
        h.executor
            .on_tick(Tick::new("005930", 10_350.0, 3, t0() + ChronoDuration::minutes(1)))
            .await;

        assert!(!h.executor.positions().has_open_position("005930"));
        assert_eq!(h.executor.sizer().state().daily_realized_pnl, 4_000.0);

        {
            let events = h.notifier.events.lock();
            match &events[1] {
                Notification::PositionClosed {
                    price,
                    reason,
                    assessment,
                    ..
                } => {
                    assert_eq!(*price, 10_400.0);
                    assert_eq!(reason, "take_profit");
                    assert!(assessment.starts_with("profitable sell"), "{}", assessment);
                }
                other => panic!("expected a close, got {:?}", other),
            }
        }
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_exit_stays_queued_then_retries() {
        let mut h = harness(ExecutionConfig {
            exit_backoff_ms: 1,
            ..Default::default()
        })
        .await;
        h.paper.set_price("005930", 10_000.0);
        h.executor.buy("005930", 10_000.0, 5, "test entry", t0()).await;

        h.paper.fail_next_orders(3);
        h.executor
            .on_tick(Tick::new("005930", 9_700.0, 1, t0() + ChronoDuration::minutes(1)))
            .await;

        let position = h.executor.positions().get("005930").unwrap();
        assert_eq!(position.status, PositionStatus::ExitQueued);
        assert_eq!(position.exit_attempts, 1);

        // Next update retries the queued exit
        h.executor
            .on_tick(Tick::new("005930", 9_720.0, 1, t0() + ChronoDuration::minutes(2)))
            .await;
        assert!(!h.executor.positions().has_open_position("005930"));
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_entry_vetoed_outside_session_and_without_history() {
        let mut h = harness(ExecutionConfig::default()).await;

        h.executor.set_entries_enabled(false);
        let decision = h.executor.evaluate_entry("005930", 71_000.0).await;
        assert_eq!(decision.action, ExecutionAction::Skip);
        assert!(decision.reason.contains("session"));

        h.executor.set_entries_enabled(true);
        let decision = h
            .executor
            .on_tick(Tick::new("005930", 71_000.0, 10, t0()))
            .await
            .unwrap();
        assert_eq!(decision.action, ExecutionAction::Skip);
        assert!(decision.reason.contains("insufficient data"));
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_entry_check_does_not_wait_on_market_outage() {
        let mut h = harness(ExecutionConfig::default()).await;
        // Three attempts with 1s and 2s backoff if awaited inline
        h.executor.market = Arc::new(MarketConditionGate::new(
            h.paper.clone(),
            MarketConfig::default(),
        ));
        h.paper
            .fail_next_calls(1_000, || GatewayError::Timeout(Duration::from_secs(10)));

        let started = std::time::Instant::now();
        let decision = h.executor.evaluate_entry("005930", 71_000.0).await;
        assert_eq!(decision.action, ExecutionAction::Skip);
        assert!(started.elapsed() < Duration::from_millis(500));
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_risk_veto_precedes_signal() {
        let mut h = harness(ExecutionConfig::default()).await;
        h.executor.prime_risk(
            (0..3)
                .map(|i| {
                    TradeRecord::sell(
                        "000660",
                        100.0,
                        95.0,
                        10,
                        t0() + ChronoDuration::minutes(i),
                        "stop_loss",
                    )
                })
                .collect(),
        );

        let decision = h.executor.evaluate_entry("005930", 71_000.0).await;
        assert!(decision.reason.starts_with("risk:"), "{}", decision.reason);
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_target_sold_only_in_profit() {
        let mut h = harness(ExecutionConfig::default()).await;
        h.paper.set_price("005930", 10_000.0);
        h.paper.set_price("000660", 10_000.0);
        h.executor.buy("005930", 10_000.0, 5, "entry", t0()).await;
        h.executor.buy("000660", 10_000.0, 5, "entry", t0()).await;

        // +1.5% and -0.5%, neither crossing an exit rule
        h.executor.positions.on_price_at("005930", 10_150.0, t0());
        h.executor.positions.on_price_at("000660", 9_950.0, t0());
        h.paper.set_price("005930", 10_150.0);

        let sold = h.executor.on_targets_changed(&[]).await;
        assert_eq!(sold, 1);
        assert_eq!(h.executor.held_symbols(), vec!["000660".to_string()]);
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_emergency_exit_and_summary() {
        let mut h = harness(ExecutionConfig::default()).await;
        h.paper.set_price("005930", 10_000.0);
        h.executor.buy("005930", 10_000.0, 5, "entry", t0()).await;
        h.executor.positions.on_price_at("005930", 10_100.0, t0());

        let summary = h.executor.summary();
        assert_eq!(summary.positions.len(), 1);
        assert_eq!(summary.unrealized_pnl, 500.0);
        assert_eq!(summary.daily_buys, 1);

        assert_eq!(h.executor.emergency_exit_all("feed failed").await, 1);
        assert!(h.executor.positions().is_empty());
        h.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_task_flushes_bars_on_shutdown() {
        let h = harness(ExecutionConfig::default()).await;
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let engine = tokio::spawn(h.executor.run(tick_rx, cmd_rx, shutdown.clone()));
        tick_tx.send(Tick::new("005930", 71_000.0, 10, t0())).await.unwrap();
        tick_tx
            .send(Tick::new("005930", 71_100.0, 5, t0() + ChronoDuration::seconds(20)))
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(EngineCommand::Summary(reply_tx)).await.unwrap();
        assert!(reply_rx.await.unwrap().positions.is_empty());

        shutdown.cancel();
        let executor = engine.await.unwrap();
        assert_eq!(executor.series().len("005930"), 2);

        h.store.shutdown().await;
        let counts = crate::persistence::StoreBackend::row_counts(&h.storage)
            .await
            .unwrap();
        assert_eq!(counts.ticks, 2);
        assert_eq!(counts.minute_bars, 1);
    }
}
