use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

/// Span of recent prices that defines the short rolling high/low
const HIGH_LOW_SPAN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesField {
    Price,
    Volume,
    High,
    Low,
}

/// Fixed-capacity ring buffers for one symbol
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    timestamps: VecDeque<DateTime<Utc>>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, capacity: usize) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(value);
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
            highs: VecDeque::with_capacity(capacity),
            lows: VecDeque::with_capacity(capacity),
            timestamps: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&mut self, price: f64, volume: f64, timestamp: DateTime<Utc>) {
        push_bounded(&mut self.prices, price, self.capacity);
        push_bounded(&mut self.volumes, volume, self.capacity);
        push_bounded(&mut self.timestamps, timestamp, self.capacity);

        let (high, low) = if volume <= 0.0 {
            // No trade behind this update: carry the previous extremes
            (
                self.highs.back().copied().unwrap_or(price),
                self.lows.back().copied().unwrap_or(price),
            )
        } else if self.prices.len() >= HIGH_LOW_SPAN {
            let recent = self.prices.iter().rev().take(HIGH_LOW_SPAN);
            recent.fold((f64::NEG_INFINITY, f64::INFINITY), |(hi, lo), &p| {
                (hi.max(p), lo.min(p))
            })
        } else {
            (price, price)
        };

        push_bounded(&mut self.highs, high, self.capacity);
        push_bounded(&mut self.lows, low, self.capacity);
    }

    fn series(&self, field: SeriesField) -> &VecDeque<f64> {
        match field {
            SeriesField::Price => &self.prices,
            SeriesField::Volume => &self.volumes,
            SeriesField::High => &self.highs,
            SeriesField::Low => &self.lows,
        }
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.back().copied()
    }
}

/// Per-symbol rolling price/volume state.
///
/// Owned by the engine task; other components read snapshots via `recent`.
#[derive(Debug, Clone)]
pub struct RollingSeriesStore {
    windows: HashMap<String, RollingWindow>,
    capacity: usize,
}

impl RollingSeriesStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            capacity,
        }
    }

    /// Append a tick. Windows are created lazily on the first tick.
    pub fn record_tick(&mut self, symbol: &str, price: f64, volume: f64, timestamp: DateTime<Utc>) {
        let capacity = self.capacity;
        self.windows
            .entry(symbol.to_string())
            .or_insert_with(|| RollingWindow::new(capacity))
            .record(price, volume, timestamp);
    }

    /// Up to the last `count` values (all when `None`), oldest first.
    /// Empty for an unseen symbol.
    pub fn recent(&self, symbol: &str, field: SeriesField, count: Option<usize>) -> Vec<f64> {
        let Some(window) = self.windows.get(symbol) else {
            return Vec::new();
        };
        let series = window.series(field);
        let n = count.unwrap_or(series.len()).min(series.len());
        series.iter().skip(series.len() - n).copied().collect()
    }

    pub fn has_min_history(&self, symbol: &str, n: usize) -> bool {
        self.len(symbol) >= n
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map(|w| w.len()).unwrap_or(0)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.windows.get(symbol)?.prices.back().copied()
    }

    pub fn window(&self, symbol: &str) -> Option<&RollingWindow> {
        self.windows.get(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.windows.keys().cloned().collect()
    }
}
