use std::collections::HashMap;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Broker commission and transaction tax
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeModel {
    pub buy_rate: f64,
    pub sell_rate: f64,
    pub tax_rate: f64,
    pub min_fee: f64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            buy_rate: 0.00015,  // 0.015%
            sell_rate: 0.00015, // 0.015%
            tax_rate: 0.0023,   // 0.23% securities transaction tax
            min_fee: 1.0,
        }
    }
}

impl FeeModel {
    pub fn buy_fee(&self, price: f64, quantity: u64) -> f64 {
        (price * quantity as f64 * self.buy_rate).max(self.min_fee)
    }

    pub fn sell_fee(&self, price: f64, quantity: u64) -> f64 {
        (price * quantity as f64 * (self.sell_rate + self.tax_rate)).max(self.min_fee)
    }

    /// Lowest exit price at which `(exit - entry)·qty - sell_fee(exit)`
    /// covers `multiple × buy_fee(entry)`
    pub fn min_profitable_exit(&self, entry_price: f64, quantity: u64, multiple: f64) -> f64 {
        if quantity == 0 {
            return entry_price;
        }
        let qty = quantity as f64;
        let required = self.buy_fee(entry_price, quantity) * multiple;
        let sell_rate = self.sell_rate + self.tax_rate;

        let exit = (entry_price * qty + required) / (qty * (1.0 - sell_rate));

        // The percentage solution is below the minimum fee for tiny notionals
        if exit * qty * sell_rate < self.min_fee {
            (entry_price * qty + required + self.min_fee) / qty
        } else {
            exit
        }
    }

    /// Realized profit net of both legs' fees
    pub fn net_profit(&self, entry_price: f64, exit_price: f64, quantity: u64) -> f64 {
        (exit_price - entry_price) * quantity as f64
            - self.buy_fee(entry_price, quantity)
            - self.sell_fee(exit_price, quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConfig {
    pub reentry_cooldown_minutes: i64,
    pub max_daily_trades: u32,
    pub max_daily_trades_per_symbol: u32,
    pub consecutive_loss_limit: u32,
    pub loss_cooldown_minutes: i64,
    pub min_profit_to_fee_ratio: f64,
    pub max_required_move_pct: f64, // Veto buys whose break-even move exceeds this (percent)
    pub protective_loss_pct: f64,   // Sells at or below this pnl are always allowed (percent)
    pub fees: FeeModel,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            reentry_cooldown_minutes: 10,
            max_daily_trades: 10,
            max_daily_trades_per_symbol: 3,
            consecutive_loss_limit: 2,
            loss_cooldown_minutes: 60,
            min_profit_to_fee_ratio: 2.0,
            max_required_move_pct: 1.0,
            protective_loss_pct: -2.0,
            fees: FeeModel::default(),
        }
    }
}

/// Per-symbol cooldown bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolCooldownState {
    pub last_sell_time: Option<DateTime<Utc>>,
    pub consecutive_losses: u32,
    pub loss_cooldown_until: Option<DateTime<Utc>>,
    pub daily_trade_count: u32,
}

impl SymbolCooldownState {
    /// Nothing left to remember once all windows have passed
    fn is_idle(&self, now: DateTime<Utc>, reentry: Duration) -> bool {
        self.daily_trade_count == 0
            && self.consecutive_losses == 0
            && self.loss_cooldown_until.map_or(true, |until| now >= until)
            && self.last_sell_time.map_or(true, |t| now >= t + reentry)
    }
}

/// Outcome of a frequency check, always with a human-readable reason
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

impl Verdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Throttles re-entries and filters fee-dominated trades
pub struct FrequencyController {
    config: FrequencyConfig,
    symbols: HashMap<String, SymbolCooldownState>,
    daily_buys: u32,
    today: NaiveDate,
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

impl FrequencyController {
    pub fn new(config: FrequencyConfig) -> Self {
        Self::new_at(config, Utc::now())
    }

    pub fn new_at(config: FrequencyConfig, now: DateTime<Utc>) -> Self {
        tracing::info!(
            "Frequency controller: re-entry cooldown {}m, daily max {}, per symbol {}",
            config.reentry_cooldown_minutes,
            config.max_daily_trades,
            config.max_daily_trades_per_symbol
        );
        Self {
            config,
            symbols: HashMap::new(),
            daily_buys: 0,
            today: local_date(now),
        }
    }

    pub fn fees(&self) -> &FeeModel {
        &self.config.fees
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<&SymbolCooldownState> {
        self.symbols.get(symbol)
    }

    pub fn daily_buys(&self) -> u32 {
        self.daily_buys
    }

    pub fn tracked_symbols(&self) -> usize {
        self.symbols.len()
    }

    fn reentry_cooldown(&self) -> Duration {
        Duration::minutes(self.config.reentry_cooldown_minutes)
    }

    /// New calendar day: zero the counters and forget symbols with nothing pending
    fn reset_daily_at(&mut self, now: DateTime<Utc>) {
        let today = local_date(now);
        if today == self.today {
            return;
        }
        tracing::info!(
            "Frequency reset: {} -> {} ({} buys yesterday)",
            self.today,
            today,
            self.daily_buys
        );
        self.today = today;
        self.daily_buys = 0;

        let reentry = self.reentry_cooldown();
        for state in self.symbols.values_mut() {
            state.daily_trade_count = 0;
            if state.loss_cooldown_until.is_some_and(|until| now >= until) {
                state.consecutive_losses = 0;
                state.loss_cooldown_until = None;
            }
        }
        self.symbols.retain(|_, state| !state.is_idle(now, reentry));
    }

    pub fn can_buy(&mut self, symbol: &str, price: f64, quantity: u64) -> Verdict {
        self.can_buy_at(symbol, price, quantity, Utc::now())
    }

    pub fn can_buy_at(
        &mut self,
        symbol: &str,
        price: f64,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> Verdict {
        self.reset_daily_at(now);

        if self.daily_buys >= self.config.max_daily_trades {
            return Verdict::deny(format!(
                "daily trade limit reached ({}/{})",
                self.daily_buys, self.config.max_daily_trades
            ));
        }

        if let Some(state) = self.symbols.get(symbol) {
            if state.daily_trade_count >= self.config.max_daily_trades_per_symbol {
                return Verdict::deny(format!(
                    "{} daily trade limit reached ({}/{})",
                    symbol, state.daily_trade_count, self.config.max_daily_trades_per_symbol
                ));
            }

            if let Some(until) = state.loss_cooldown_until {
                if now < until {
                    return Verdict::deny(format!(
                        "{} paused after {} consecutive losses ({:.1} min left)",
                        symbol,
                        state.consecutive_losses,
                        (until - now).num_seconds() as f64 / 60.0
                    ));
                }
            }

            if let Some(sold) = state.last_sell_time {
                let ends = sold + self.reentry_cooldown();
                if now < ends {
                    return Verdict::deny(format!(
                        "{} re-entry cooldown ({:.1} min left)",
                        symbol,
                        (ends - now).num_seconds() as f64 / 60.0
                    ));
                }
            }
        }

        if price <= 0.0 || quantity == 0 {
            return Verdict::deny(format!("invalid order {} x {}", quantity, price));
        }

        let min_exit = self.config.fees.min_profitable_exit(
            price,
            quantity,
            self.config.min_profit_to_fee_ratio,
        );
        let required_move_pct = (min_exit - price) / price * 100.0;
        if required_move_pct > self.config.max_required_move_pct {
            return Verdict::deny(format!(
                "fees need a {:.2}% move (exit >= {:.0}), max {:.2}%",
                required_move_pct, min_exit, self.config.max_required_move_pct
            ));
        }

        Verdict::allow(format!(
            "buy allowed (daily {}/{}, break-even exit {:.0})",
            self.daily_buys + 1,
            self.config.max_daily_trades,
            min_exit
        ))
    }

    /// Never blocks a sell; the reason says why it is (or isn't) attractive
    pub fn can_sell(&self, current_price: f64, entry_price: f64, quantity: u64) -> Verdict {
        if entry_price <= 0.0 {
            return Verdict::allow("sell allowed (unknown entry)");
        }

        let pnl_pct = (current_price - entry_price) / entry_price * 100.0;
        if pnl_pct <= self.config.protective_loss_pct {
            return Verdict::allow(format!("protective sell ({:+.2}%)", pnl_pct));
        }

        let net = self.config.fees.net_profit(entry_price, current_price, quantity);
        if net > 0.0 {
            Verdict::allow(format!("profitable sell (net {:+.0})", net))
        } else {
            Verdict::allow(format!("position cleanup (net {:+.0})", net))
        }
    }

    pub fn record_buy(&mut self, symbol: &str) {
        self.record_buy_at(symbol, Utc::now())
    }

    pub fn record_buy_at(&mut self, symbol: &str, now: DateTime<Utc>) {
        self.reset_daily_at(now);
        self.daily_buys += 1;

        let state = self.symbols.entry(symbol.to_string()).or_default();
        state.daily_trade_count += 1;

        if state.loss_cooldown_until.is_some_and(|until| now >= until) {
            state.consecutive_losses = 0;
            state.loss_cooldown_until = None;
        }

        tracing::debug!(
            "{} buy recorded: daily {}/{}, symbol {}/{}",
            symbol,
            self.daily_buys,
            self.config.max_daily_trades,
            state.daily_trade_count,
            self.config.max_daily_trades_per_symbol
        );
    }

    pub fn record_sell(&mut self, symbol: &str, entry_price: f64, exit_price: f64, quantity: u64) {
        self.record_sell_at(symbol, entry_price, exit_price, quantity, Utc::now())
    }

    pub fn record_sell_at(
        &mut self,
        symbol: &str,
        entry_price: f64,
        exit_price: f64,
        quantity: u64,
        now: DateTime<Utc>,
    ) {
        self.reset_daily_at(now);
        let net = self.config.fees.net_profit(entry_price, exit_price, quantity);
        let limit = self.config.consecutive_loss_limit;
        let loss_cooldown = Duration::minutes(self.config.loss_cooldown_minutes);

        let state = self.symbols.entry(symbol.to_string()).or_default();
        state.last_sell_time = Some(now);

        if net < 0.0 {
            state.consecutive_losses += 1;
            if state.consecutive_losses >= limit {
                state.loss_cooldown_until = Some(now + loss_cooldown);
                tracing::warn!(
                    "⏸️  {} paused for {} min after {} consecutive losses",
                    symbol,
                    loss_cooldown.num_minutes(),
                    state.consecutive_losses
                );
            }
        } else {
            state.consecutive_losses = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 3, 0, 0).unwrap()
    }

    fn controller() -> FrequencyController {
        FrequencyController::new_at(FrequencyConfig::default(), t0())
    }

    #[test]
    fn test_fee_model() {
        let fees = FeeModel::default();
        assert!((fees.buy_fee(10_000.0, 10) - 15.0).abs() < 1e-9);
        assert!((fees.sell_fee(10_000.0, 10) - 245.0).abs() < 1e-9);
        assert_eq!(fees.buy_fee(100.0, 1), 1.0);
    }

    #[test]
    fn test_min_profitable_exit_covers_fees() {
        let fees = FeeModel::default();
        let exit = fees.min_profitable_exit(10_000.0, 10, 2.0);
        let profit = (exit - 10_000.0) * 10.0 - fees.sell_fee(exit, 10);
        assert!((profit - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_consecutive_losses_pause_symbol() {
        let mut freq = controller();
        let mut now = t0();

        for _ in 0..3 {
            freq.record_sell_at("005930", 10_000.0, 9_900.0, 10, now);
            now += Duration::minutes(1);
        }

        let verdict = freq.can_buy_at("005930", 10_000.0, 10, now);
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("consecutive losses"), "{}", verdict.reason);

        // Still paused just before the cooldown elapses
        let until = freq.symbol_state("005930").unwrap().loss_cooldown_until.unwrap();
        let verdict = freq.can_buy_at("005930", 10_000.0, 10, until - Duration::seconds(1));
        assert!(!verdict.allowed);

        let verdict = freq.can_buy_at("005930", 10_000.0, 10, until + Duration::seconds(1));
        assert!(verdict.allowed, "{}", verdict.reason);

        freq.record_buy_at("005930", until + Duration::seconds(1));
        assert_eq!(freq.symbol_state("005930").unwrap().consecutive_losses, 0);
    }

    #[test]
    fn test_reentry_cooldown() {
        let mut freq = controller();
        freq.record_sell_at("000660", 10_000.0, 10_300.0, 10, t0());

        let verdict = freq.can_buy_at("000660", 10_000.0, 10, t0() + Duration::minutes(5));
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("re-entry"));

        let verdict = freq.can_buy_at("000660", 10_000.0, 10, t0() + Duration::minutes(11));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_daily_limits() {
        let mut freq = controller();
        for _ in 0..3 {
            freq.record_buy_at("005930", t0());
        }
        let verdict = freq.can_buy_at("005930", 10_000.0, 10, t0());
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("005930 daily trade limit"));

        for i in 0..7 {
            freq.record_buy_at(&format!("00000{}", i), t0());
        }
        let verdict = freq.can_buy_at("035720", 10_000.0, 10, t0());
        assert!(verdict.reason.starts_with("daily trade limit"));

        // Next day the counters are fresh
        let verdict = freq.can_buy_at("005930", 10_000.0, 10, t0() + Duration::days(1));
        assert!(verdict.allowed);
        assert_eq!(freq.daily_buys(), 0);
    }

    #[test]
    fn test_fee_filter_vetoes_tiny_notional() {
        let mut freq = controller();
        // One share at 100: the 1 won minimum fee dominates
        let verdict = freq.can_buy_at("005930", 100.0, 1, t0());
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("fees need"));
    }

    #[test]
    fn test_sells_are_never_blocked() {
        let freq = controller();
        let stop = freq.can_sell(9_700.0, 10_000.0, 10);
        assert!(stop.allowed);
        assert!(stop.reason.starts_with("protective"));

        let small = freq.can_sell(10_010.0, 10_000.0, 10);
        assert!(small.allowed);
        assert!(small.reason.starts_with("position cleanup"));

        let win = freq.can_sell(10_300.0, 10_000.0, 10);
        assert!(win.reason.starts_with("profitable"));
    }

    #[test]
    fn test_idle_symbols_pruned_on_new_day() {
        let mut freq = controller();
        freq.record_buy_at("005930", t0());
        freq.record_sell_at("005930", 10_000.0, 10_300.0, 10, t0());
        freq.record_sell_at("000660", 10_000.0, 9_000.0, 10, t0());
        assert_eq!(freq.tracked_symbols(), 2);

        freq.can_buy_at("035720", 10_000.0, 10, t0() + Duration::days(1));
        // 000660 still carries a loss streak
        assert_eq!(freq.tracked_symbols(), 1);
        assert!(freq.symbol_state("000660").is_some());
    }
}
