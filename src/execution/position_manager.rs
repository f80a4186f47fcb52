use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::models::TradeRecord;

/// Price-level and time-based exit rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: f64,
    pub crash_guard_pct: f64, // Hard floor on pnl %, regardless of the stop
    pub surge_guard_pct: f64, // Lock in outsized gains
    pub base_hold_minutes: f64,
    pub min_hold_minutes: f64,
    pub max_hold_minutes: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.02,      // -2%
            take_profit_pct: 0.03,    // +3%
            trailing_stop_pct: 0.015, // 1.5% below the high water mark
            crash_guard_pct: -5.0,
            surge_guard_pct: 8.0,
            base_hold_minutes: 45.0,
            min_hold_minutes: 15.0,
            max_hold_minutes: 120.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Monitored,
    ExitQueued,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    CrashProtection,
    TrailingStop,
    TakeProfit,
    SurgeProtection,
    TimeProfit,
    TimeLoss,
    SellSignal,
    TargetRemoved,
    Emergency,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::CrashProtection => "crash_protection",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::SurgeProtection => "surge_protection",
            ExitReason::TimeProfit => "time_profit",
            ExitReason::TimeLoss => "time_loss",
            ExitReason::SellSignal => "sell_signal",
            ExitReason::TargetRemoved => "target_removed",
            ExitReason::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub quantity: u64,
    pub avg_entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_stop_price: Option<f64>, // Armed once price trades above entry
    pub highest_price_seen: f64,
    pub lowest_price_seen: f64,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub exit_attempts: u32,
}

impl Position {
    pub fn pnl_pct(&self) -> f64 {
        (self.current_price - self.avg_entry_price) / self.avg_entry_price * 100.0
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.avg_entry_price) * self.quantity as f64
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Monitored)
    }
}

/// Owns every open position; at most one per symbol
pub struct PositionManager {
    positions: HashMap<String, Position>,
    rules: ExitRules,
}

impl PositionManager {
    pub fn new(rules: ExitRules) -> Self {
        Self {
            positions: HashMap::new(),
            rules,
        }
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn open_position(&mut self, symbol: &str, price: f64, quantity: u64) -> anyhow::Result<Uuid> {
        self.open_position_at(symbol, price, quantity, None)
    }

    /// Create a position after a confirmed buy fill
    pub fn open_position_at(
        &mut self,
        symbol: &str,
        price: f64,
        quantity: u64,
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Uuid> {
        if self.positions.contains_key(symbol) {
            anyhow::bail!("Already have open position for {}", symbol);
        }
        if price.is_nan() || price <= 0.0 {
            anyhow::bail!("Invalid entry price {} for {}", price, symbol);
        }
        if quantity == 0 {
            anyhow::bail!("Cannot open zero-quantity position for {}", symbol);
        }

        let id = Uuid::new_v4();
        let position = Position {
            id,
            symbol: symbol.to_string(),
            quantity,
            avg_entry_price: price,
            entry_time: timestamp.unwrap_or_else(Utc::now),
            current_price: price,
            stop_loss_price: price * (1.0 - self.rules.stop_loss_pct),
            take_profit_price: price * (1.0 + self.rules.take_profit_pct),
            trailing_stop_price: None,
            highest_price_seen: price,
            lowest_price_seen: price,
            status: PositionStatus::Open,
            exit_reason: None,
            exit_attempts: 0,
        };

        tracing::info!(
            "📥 Opened {} x{} @ {:.0} (SL {:.0}, TP {:.0})",
            symbol,
            quantity,
            price,
            position.stop_loss_price,
            position.take_profit_price
        );

        self.positions.insert(symbol.to_string(), position);
        Ok(id)
    }

    /// Restore a position reported by the broker at startup
    pub fn adopt(&mut self, symbol: &str, price: f64, quantity: u64) -> anyhow::Result<Uuid> {
        let id = self.open_position_at(symbol, price, quantity, None)?;
        if let Some(p) = self.positions.get_mut(symbol) {
            p.status = PositionStatus::Monitored;
        }
        Ok(id)
    }

    /// Holding limit adjusted for trend and pnl, clipped to the configured band
    pub fn dynamic_max_hold(&self, position: &Position) -> Duration {
        let base = self.rules.base_hold_minutes;
        let pnl = position.pnl_pct();

        let minutes = if pnl > 2.0 {
            base * (1.0 + pnl / 10.0).min(2.0)
        } else if pnl < -1.0 {
            base * (1.0 + pnl / 10.0).max(0.6)
        } else if position.highest_price_seen > position.avg_entry_price {
            let pullback = (position.highest_price_seen - position.current_price)
                / position.highest_price_seen
                * 100.0;
            if pullback > 1.5 {
                base * 0.8
            } else if pullback < 0.5 && pnl > 0.5 {
                base * 1.3
            } else {
                base
            }
        } else {
            base
        };

        let minutes = minutes.clamp(self.rules.min_hold_minutes, self.rules.max_hold_minutes);
        Duration::seconds((minutes * 60.0).round() as i64)
    }

    fn exit_condition(&self, position: &Position, now: DateTime<Utc>) -> Option<ExitReason> {
        let price = position.current_price;
        let pnl = position.pnl_pct();

        // Protective exits first
        if price <= position.stop_loss_price {
            return Some(ExitReason::StopLoss);
        }
        if pnl <= self.rules.crash_guard_pct {
            return Some(ExitReason::CrashProtection);
        }
        if let Some(trailing) = position.trailing_stop_price {
            if price <= trailing {
                return Some(ExitReason::TrailingStop);
            }
        }
        if price >= position.take_profit_price {
            return Some(ExitReason::TakeProfit);
        }
        if pnl >= self.rules.surge_guard_pct {
            return Some(ExitReason::SurgeProtection);
        }
        if position.age(now) >= self.dynamic_max_hold(position) {
            return Some(if pnl > 0.0 {
                ExitReason::TimeProfit
            } else {
                ExitReason::TimeLoss
            });
        }
        None
    }

    pub fn on_price(&mut self, symbol: &str, price: f64) -> Option<ExitReason> {
        self.on_price_at(symbol, price, Utc::now())
    }

    /// Apply a price update. Returns the exit reason when the position is
    /// (or remains) queued for exit.
    pub fn on_price_at(
        &mut self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        if price.is_nan() || price <= 0.0 {
            return None;
        }

        let trailing_pct = self.rules.trailing_stop_pct;
        let position = self.positions.get_mut(symbol)?;

        position.current_price = price;
        position.lowest_price_seen = position.lowest_price_seen.min(price);
        if price > position.highest_price_seen {
            position.highest_price_seen = price;
        }

        // Ratchet only upward, once the position has traded above entry
        if position.highest_price_seen > position.avg_entry_price {
            let candidate = position.highest_price_seen * (1.0 - trailing_pct);
            if position.trailing_stop_price.map_or(true, |t| candidate > t) {
                position.trailing_stop_price = Some(candidate);
            }
        }

        match position.status {
            PositionStatus::ExitQueued => return position.exit_reason,
            PositionStatus::Closed => return None,
            PositionStatus::Open => position.status = PositionStatus::Monitored,
            PositionStatus::Monitored => {}
        }

        let snapshot = position.clone();
        let reason = self.exit_condition(&snapshot, now)?;

        if let Some(position) = self.positions.get_mut(symbol) {
            position.status = PositionStatus::ExitQueued;
            position.exit_reason = Some(reason);
        }

        tracing::info!(
            "🚨 {} exit queued: {} @ {:.0} ({:+.2}%)",
            symbol,
            reason,
            price,
            snapshot.pnl_pct()
        );
        Some(reason)
    }

    /// Queue an exit for reasons outside the price rules
    pub fn queue_exit(&mut self, symbol: &str, reason: ExitReason) -> bool {
        match self.positions.get_mut(symbol) {
            Some(position) if position.is_active() => {
                position.status = PositionStatus::ExitQueued;
                position.exit_reason = Some(reason);
                tracing::info!("{} exit queued: {}", symbol, reason);
                true
            }
            _ => false,
        }
    }

    /// Queue every active position for exit; returns the affected symbols
    pub fn queue_emergency_exit_all(&mut self, why: &str) -> Vec<String> {
        let mut queued = Vec::new();
        for (symbol, position) in self.positions.iter_mut() {
            if position.is_active() {
                position.status = PositionStatus::ExitQueued;
                position.exit_reason = Some(ExitReason::Emergency);
                queued.push(symbol.clone());
            }
        }
        if !queued.is_empty() {
            tracing::warn!("⚠️  Emergency exit of {} positions: {}", queued.len(), why);
        }
        queued
    }

    /// Positions waiting for a sell, with their reasons
    pub fn pending_exits(&self) -> Vec<(String, ExitReason)> {
        self.positions
            .values()
            .filter(|p| p.status == PositionStatus::ExitQueued)
            .filter_map(|p| p.exit_reason.map(|r| (p.symbol.clone(), r)))
            .collect()
    }

    /// Sell submission failed; the exit stays queued for the next update
    pub fn exit_failed(&mut self, symbol: &str) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.exit_attempts += 1;
            tracing::warn!(
                "{} exit still pending after {} failed rounds",
                symbol,
                position.exit_attempts
            );
        }
    }

    pub fn complete_exit(&mut self, symbol: &str, fill_price: f64) -> anyhow::Result<TradeRecord> {
        self.complete_exit_at(symbol, fill_price, None)
    }

    /// Confirmed sell fill: remove the position and produce its trade record
    pub fn complete_exit_at(
        &mut self,
        symbol: &str,
        fill_price: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<TradeRecord> {
        let position = self
            .positions
            .get(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;

        if position.status != PositionStatus::ExitQueued {
            anyhow::bail!("Position {} is not queued for exit", symbol);
        }

        let reason = position.exit_reason.unwrap_or(ExitReason::Emergency);
        let mut position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;
        position.status = PositionStatus::Closed;

        let record = TradeRecord::sell(
            symbol,
            position.avg_entry_price,
            fill_price,
            position.quantity,
            timestamp.unwrap_or_else(Utc::now),
            reason.as_str(),
        );

        tracing::info!(
            "📤 Closed {} x{} @ {:.0}: {} P&L {:+.0} ({:+.2}%)",
            symbol,
            position.quantity,
            fill_price,
            reason,
            record.pnl(),
            record.realized_pnl_pct.unwrap_or(0.0)
        );
        Ok(record)
    }
}
