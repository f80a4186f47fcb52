use std::collections::VecDeque;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use super::circuit_breakers::{AccountRiskState, CircuitBreakerTrip, CircuitBreakers};
use crate::models::TradeRecord;

/// Sells kept in memory for statistics and loss-streak recomputation
const MAX_SELL_HISTORY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub initial_balance: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub min_balance_ratio: f64,
    pub max_loss_per_trade_pct: f64,
    pub kelly_history: usize,
    pub flat_fraction: f64,
    pub kelly_safety: f64,
    pub min_fraction: f64,
    pub max_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_balance: 1_000_000.0,
            max_daily_loss_pct: 0.05,
            max_consecutive_losses: 3,
            min_balance_ratio: 0.5,
            max_loss_per_trade_pct: 0.02, // Loss at the stop may not exceed 2% of balance
            kelly_history: 20,            // Last 20 sells
            flat_fraction: 0.05,          // Used until there is a win on record
            kelly_safety: 0.5,            // Half-Kelly
            min_fraction: 0.02,
            max_fraction: 0.15,
        }
    }
}

impl RiskConfig {
    pub fn circuit_breakers(&self) -> CircuitBreakers {
        CircuitBreakers {
            max_daily_loss_pct: self.max_daily_loss_pct,
            max_consecutive_losses: self.max_consecutive_losses,
            min_balance_ratio: self.min_balance_ratio,
        }
    }
}

/// Win rate and average win/loss magnitudes (fractions) over recent sells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradingStats {
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub sample: usize,
}

/// Account-level trade permission and Kelly-derived position sizing
pub struct RiskSizer {
    config: RiskConfig,
    breakers: CircuitBreakers,
    stop_loss_pct: f64,
    state: AccountRiskState,
    sells: VecDeque<TradeRecord>,
}

impl RiskSizer {
    /// `stop_loss_pct` is the configured exit stop, used to cap per-trade loss
    pub fn new(config: RiskConfig, stop_loss_pct: f64) -> Self {
        Self::new_at(config, stop_loss_pct, Local::now().date_naive())
    }

    pub fn new_at(config: RiskConfig, stop_loss_pct: f64, today: NaiveDate) -> Self {
        let breakers = config.circuit_breakers();
        let state = AccountRiskState::new(config.initial_balance, today);
        Self {
            config,
            breakers,
            stop_loss_pct,
            state,
            sells: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &AccountRiskState {
        &self.state
    }

    /// Restore sell history from the persisted trade log. Sells dated on
    /// the current trading day also count toward today's P&L and balance.
    pub fn prime(&mut self, history: impl IntoIterator<Item = TradeRecord>) {
        let today = self.state.last_reset_date;
        for record in history.into_iter().filter(|r| r.is_sell()) {
            if record.timestamp.with_timezone(&Local).date_naive() == today {
                let pnl = record.pnl();
                self.state.daily_realized_pnl += pnl;
                self.state.current_balance += pnl;
                self.state.today_trade_count += 1;
            }
            self.push_sell(record);
        }
        self.state.consecutive_losses = self.trailing_losses();
        tracing::info!(
            "Risk sizer primed with {} sells ({} consecutive losses, {} today, daily P&L {:+.0})",
            self.sells.len(),
            self.state.consecutive_losses,
            self.state.today_trade_count,
            self.state.daily_realized_pnl
        );
    }

    pub fn can_trade(&mut self) -> Result<(), CircuitBreakerTrip> {
        self.can_trade_at(Local::now().date_naive())
    }

    pub fn can_trade_at(&mut self, today: NaiveDate) -> Result<(), CircuitBreakerTrip> {
        self.reset_daily_at(today);
        self.breakers.check(&self.state)
    }

    /// Zero daily counters when the calendar date has advanced
    pub fn reset_daily_at(&mut self, today: NaiveDate) {
        if today == self.state.last_reset_date {
            return;
        }
        tracing::info!("Daily risk reset: {} -> {}", self.state.last_reset_date, today);
        self.state.daily_realized_pnl = 0.0;
        self.state.today_trade_count = 0;
        self.state.last_reset_date = today;
        self.state.consecutive_losses = self.trailing_losses();
    }

    /// Losing sells counted back from the most recent until a winning one
    fn trailing_losses(&self) -> u32 {
        let mut count = 0;
        for record in self.sells.iter().rev() {
            let pnl = record.pnl();
            if pnl > 0.0 {
                break;
            }
            if pnl < 0.0 {
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> Option<TradingStats> {
        let start = self.sells.len().saturating_sub(self.config.kelly_history);
        let recent: Vec<&TradeRecord> = self.sells.iter().skip(start).collect();
        if recent.is_empty() {
            return None;
        }

        let pct = |r: &TradeRecord| r.realized_pnl_pct.unwrap_or(0.0) / 100.0;
        let wins: Vec<f64> = recent.iter().filter(|r| r.pnl() > 0.0).map(|r| pct(r)).collect();
        let losses: Vec<f64> = recent.iter().filter(|r| r.pnl() < 0.0).map(|r| pct(r)).collect();

        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.02
        } else {
            (losses.iter().sum::<f64>() / losses.len() as f64).abs()
        };

        Some(TradingStats {
            win_rate: wins.len() as f64 / recent.len() as f64,
            avg_win,
            avg_loss,
            sample: recent.len(),
        })
    }

    /// Fraction of balance to commit: flat until there is a win on record,
    /// then half-Kelly clipped to the configured band
    pub fn position_fraction(&self) -> f64 {
        match self.stats() {
            Some(s) if s.win_rate > 0.0 && s.avg_win > 0.0 => {
                let kelly = (s.avg_win * s.win_rate - s.avg_loss * (1.0 - s.win_rate)) / s.avg_win;
                let safe = (kelly * self.config.kelly_safety)
                    .clamp(self.config.min_fraction, self.config.max_fraction);
                tracing::debug!(
                    "Kelly sizing: win rate {:.1}%, kelly {:.3}, safe {:.3}",
                    s.win_rate * 100.0,
                    kelly,
                    safe
                );
                safe
            }
            _ => self.config.flat_fraction,
        }
    }

    /// Shares to buy at `price`. 0 means "do not trade".
    pub fn size_position(&self, price: f64) -> anyhow::Result<u64> {
        if price.is_nan() || price <= 0.0 {
            anyhow::bail!("Cannot size position at non-positive price {}", price);
        }

        let balance = self.state.current_balance;
        if balance <= self.state.balance_floor(self.config.min_balance_ratio) {
            return Ok(0);
        }

        let fraction = self.position_fraction();
        let kelly_qty = (balance * fraction / price).floor();

        let max_loss = balance * self.config.max_loss_per_trade_pct;
        let loss_qty = if self.stop_loss_pct > 0.0 {
            (max_loss / (price * self.stop_loss_pct)).floor()
        } else {
            kelly_qty
        };

        let quantity = kelly_qty.min(loss_qty).max(0.0) as u64;
        tracing::debug!(
            "Position size at {:.0}: kelly {} / loss cap {} -> {}",
            price,
            kelly_qty,
            loss_qty,
            quantity
        );
        Ok(quantity)
    }

    pub fn record_trade(&mut self, record: &TradeRecord) {
        if !record.is_sell() {
            return;
        }

        let pnl = record.pnl();
        self.state.daily_realized_pnl += pnl;
        self.state.current_balance += pnl;
        self.state.today_trade_count += 1;

        if pnl < 0.0 {
            self.state.consecutive_losses += 1;
        } else if pnl > 0.0 {
            self.state.consecutive_losses = 0;
        }

        self.push_sell(record.clone());

        tracing::info!(
            "P&L {:+.0} ({:+.2}%), daily {:+.0}, balance {:.0}",
            pnl,
            record.realized_pnl_pct.unwrap_or(0.0),
            self.state.daily_realized_pnl,
            self.state.current_balance
        );
    }

    fn push_sell(&mut self, record: TradeRecord) {
        self.sells.push_back(record);
        while self.sells.len() > MAX_SELL_HISTORY {
            self.sells.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn sizer() -> RiskSizer {
        RiskSizer::new_at(RiskConfig::default(), 0.02, day(4))
    }

    fn sell(entry: f64, exit: f64) -> TradeRecord {
        TradeRecord::sell("005930", entry, exit, 10, Utc::now(), "test")
    }

    #[test]
    fn test_flat_sizing_without_history() {
        let sizer = sizer();
        // 5% of 1,000,000 = 50,000 -> 5 shares at 10,000; loss cap 20,000 / 200 = 100
        assert_eq!(sizer.size_position(10_000.0).unwrap(), 5);
    }

    #[test]
    fn test_loss_cap_limits_quantity() {
        let mut config = RiskConfig::default();
        config.flat_fraction = 0.5;
        let sizer = RiskSizer::new_at(config, 0.02, day(4));
        // Kelly side 50 shares, loss cap 20,000 / (10,000 * 0.02) = 100 -> 50
        assert_eq!(sizer.size_position(10_000.0).unwrap(), 50);

        let tight = RiskSizer::new_at(
            RiskConfig {
                flat_fraction: 0.5,
                ..Default::default()
            },
            0.5,
            day(4),
        );
        // Loss cap 20,000 / (10,000 * 0.5) = 4
        assert_eq!(tight.size_position(10_000.0).unwrap(), 4);
    }

    #[test]
    fn test_zero_when_one_share_exceeds_budget() {
        let sizer = sizer();
        assert_eq!(sizer.size_position(2_000_000.0).unwrap(), 0);
    }

    #[test]
    fn test_zero_at_balance_floor() {
        let mut sizer = sizer();
        sizer.record_trade(&TradeRecord::sell("005930", 100_000.0, 50_000.0, 10, Utc::now(), "x"));
        assert_eq!(sizer.state().current_balance, 500_000.0);
        assert_eq!(sizer.size_position(1_000.0).unwrap(), 0);
    }

    #[test]
    fn test_rejects_non_positive_price() {
        let sizer = sizer();
        assert!(sizer.size_position(0.0).is_err());
        assert!(sizer.size_position(-5.0).is_err());
        assert!(sizer.size_position(f64::NAN).is_err());
    }

    #[test]
    fn test_kelly_fraction_clipped() {
        let mut sizer = sizer();
        // Mostly big wins: raw Kelly is high, clipped to 15%
        for _ in 0..9 {
            sizer.record_trade(&sell(10_000.0, 10_500.0));
        }
        sizer.record_trade(&sell(10_000.0, 9_900.0));
        assert!((sizer.position_fraction() - 0.15).abs() < 1e-9);

        // Mostly losses: Kelly negative, clipped to 2%
        let mut sizer2 = RiskSizer::new_at(RiskConfig::default(), 0.02, day(4));
        sizer2.record_trade(&sell(10_000.0, 10_100.0));
        for _ in 0..2 {
            sizer2.record_trade(&sell(10_000.0, 9_500.0));
        }
        assert!((sizer2.position_fraction() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_losses_trip_and_reset() {
        let mut sizer = sizer();
        for _ in 0..3 {
            sizer.record_trade(&sell(10_000.0, 9_990.0));
        }
        assert!(matches!(
            sizer.can_trade_at(day(4)),
            Err(CircuitBreakerTrip::ConsecutiveLosses { .. })
        ));

        sizer.record_trade(&sell(10_000.0, 10_100.0));
        assert_eq!(sizer.state().consecutive_losses, 0);
        assert!(sizer.can_trade_at(day(4)).is_ok());
    }

    #[test]
    fn test_daily_reset_recomputes_from_history() {
        let mut sizer = sizer();
        sizer.record_trade(&sell(10_000.0, 10_100.0));
        sizer.record_trade(&sell(10_000.0, 9_000.0));
        sizer.record_trade(&sell(10_000.0, 9_000.0));
        assert_eq!(sizer.state().daily_realized_pnl, 1_000.0 - 20_000.0);

        assert!(sizer.can_trade_at(day(5)).is_ok());
        assert_eq!(sizer.state().daily_realized_pnl, 0.0);
        assert_eq!(sizer.state().today_trade_count, 0);
        assert_eq!(sizer.state().consecutive_losses, 2);
    }

    #[test]
    fn test_prime_restores_loss_streak() {
        let mut sizer = sizer();
        sizer.prime(vec![
            TradeRecord::buy("005930", 10_000.0, 10, Utc::now(), "signal"),
            sell(10_000.0, 10_200.0),
            sell(10_000.0, 9_800.0),
            sell(10_000.0, 9_800.0),
            sell(10_000.0, 9_800.0),
        ]);
        assert_eq!(sizer.state().consecutive_losses, 3);
        assert!(sizer.can_trade_at(day(4)).is_err());
    }

    #[test]
    fn test_prime_restores_todays_loss() {
        let at = |d: u32, h: u32| {
            Local
                .with_ymd_and_hms(2024, 3, d, h, 0, 0)
                .unwrap()
                .with_timezone(&Utc)
        };
        let mut sizer = sizer();
        sizer.prime(vec![
            TradeRecord::sell("000660", 100_000.0, 110_000.0, 5, at(3, 14), "take_profit"),
            TradeRecord::sell("005930", 70_000.0, 64_000.0, 10, at(4, 10), "stop_loss"),
        ]);

        assert_eq!(sizer.state().daily_realized_pnl, -60_000.0);
        assert_eq!(sizer.state().today_trade_count, 1);
        assert_eq!(sizer.state().current_balance, 940_000.0);
        assert!(matches!(
            sizer.can_trade_at(day(4)),
            Err(CircuitBreakerTrip::DailyLoss { .. })
        ));

        // The next day starts clean
        assert!(sizer.can_trade_at(day(5)).is_ok());
    }
}
