use chrono::{DateTime, NaiveDate, SubsecRound, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single trade/quote update for a symbol. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Timestamps are kept at the millisecond resolution they are stored at
    pub fn new(symbol: impl Into<String>, price: f64, volume: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp: timestamp.trunc_subsecs(3),
        }
    }

    /// Timestamp truncated to the start of its minute
    pub fn minute(&self) -> DateTime<Utc> {
        truncate_to_minute(self.timestamp)
    }
}

pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// OHLCV aggregate of all ticks for one symbol within one calendar minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub timestamp: DateTime<Utc>, // minute-truncated
    pub rsi: Option<f64>,
    pub ma5: Option<f64>,
    pub ma20: Option<f64>,
}

impl MinuteBar {
    /// Start a new bar from the first tick of a minute
    pub fn open_with(tick: &Tick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            timestamp: tick.minute(),
            rsi: None,
            ma5: None,
            ma20: None,
        }
    }

    /// Fold another tick of the same minute into the bar
    pub fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume = self.volume.saturating_add(tick.volume);
    }
}

/// Granularity for reading back persisted history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Tick,
    Minute,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tick" | "ticks" => Ok(Granularity::Tick),
            "minute" | "minutes" | "bar" | "bars" => Ok(Granularity::Minute),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}

/// Persisted history in the requested granularity
#[derive(Debug, Clone, PartialEq)]
pub enum History {
    Ticks(Vec<Tick>),
    Bars(Vec<MinuteBar>),
}

impl History {
    pub fn len(&self) -> usize {
        match self {
            History::Ticks(t) => t.len(),
            History::Bars(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            other => Err(format!("unknown trade action '{}'", other)),
        }
    }
}

/// Append-only trade log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub action: TradeAction,
    pub price: f64,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
}

impl TradeRecord {
    pub fn buy(
        symbol: impl Into<String>,
        price: f64,
        quantity: u64,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            action: TradeAction::Buy,
            price,
            quantity,
            timestamp: timestamp.trunc_subsecs(3),
            reason: reason.into(),
            realized_pnl: None,
            realized_pnl_pct: None,
        }
    }

    /// Sell record; pnl is derived from the entry price
    pub fn sell(
        symbol: impl Into<String>,
        entry_price: f64,
        exit_price: f64,
        quantity: u64,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let realized_pnl = (exit_price - entry_price) * quantity as f64;
        let realized_pnl_pct = if entry_price > 0.0 {
            (exit_price - entry_price) / entry_price * 100.0
        } else {
            0.0
        };

        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            action: TradeAction::Sell,
            price: exit_price,
            quantity,
            timestamp: timestamp.trunc_subsecs(3),
            reason: reason.into(),
            realized_pnl: Some(realized_pnl),
            realized_pnl_pct: Some(realized_pnl_pct),
        }
    }

    pub fn is_sell(&self) -> bool {
        self.action == TradeAction::Sell
    }

    pub fn pnl(&self) -> f64 {
        self.realized_pnl.unwrap_or(0.0)
    }
}

/// Current quote for a symbol, as returned by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
    pub volume: u64,
    pub high: f64,
    pub low: f64,
}

/// One day of OHLCV history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: u64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub cash_available: f64,
    pub holdings: Vec<Holding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderPrice {
    Market,
    Limit(f64),
}

/// Broker acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Option<String>,
    /// Execution price, when the broker reports it with the acknowledgement
    #[serde(default)]
    pub fill_price: Option<f64>,
}

/// Broad-market index (or proxy ETF) snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub code: String,
    pub value: f64,
    pub change_pct: f64,
}

/// Entry of the broker's volume ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedStock {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub volume: u64,
    pub change_pct: f64,
}

/// Valuation ratios reported alongside a quote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialRatios {
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
}

impl FinancialRatios {
    /// Present values as (metric name, value) pairs
    pub fn metrics(&self) -> Vec<(&'static str, f64)> {
        [
            ("per", self.per),
            ("pbr", self.pbr),
            ("eps", self.eps),
            ("bps", self.bps),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}

/// Broad-market verdict used as a pre-trade veto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketCondition {
    Normal,
    Bullish,
    Bearish,
    Crash,
    HighVolatility,
}

impl MarketCondition {
    /// Conditions under which no new position may be opened
    pub fn blocks_entries(&self) -> bool {
        matches!(self, MarketCondition::Crash | MarketCondition::HighVolatility)
    }
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketCondition::Normal => "normal",
            MarketCondition::Bullish => "bullish",
            MarketCondition::Bearish => "bearish",
            MarketCondition::Crash => "crash",
            MarketCondition::HighVolatility => "high_volatility",
        };
        f.write_str(s)
    }
}
