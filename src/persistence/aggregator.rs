use std::collections::HashMap;

use crate::indicators::{calculate_rsi, calculate_sma};
use crate::models::{MinuteBar, Tick};

const RSI_PERIOD: usize = 14;

/// Folds ticks into per-symbol minute bars.
///
/// A tick from a later minute closes the symbol's current bar; the closed
/// bar is returned with indicators derived from the recent price window.
#[derive(Debug, Default)]
pub struct MinuteAggregator {
    open_bars: HashMap<String, MinuteBar>,
}

impl MinuteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a tick. `recent_prices` is the symbol's rolling price window
    /// (oldest first) used to annotate a bar that this tick closes.
    pub fn on_tick(&mut self, tick: &Tick, recent_prices: &[f64]) -> Option<MinuteBar> {
        let minute = tick.minute();

        match self.open_bars.get_mut(&tick.symbol) {
            None => {
                self.open_bars
                    .insert(tick.symbol.clone(), MinuteBar::open_with(tick));
                None
            }
            Some(bar) if bar.timestamp == minute => {
                bar.absorb(tick);
                None
            }
            Some(bar) if minute < bar.timestamp => {
                tracing::debug!(
                    "Late tick for {} at {} ignored for bar {}",
                    tick.symbol,
                    tick.timestamp,
                    bar.timestamp
                );
                None
            }
            Some(bar) => {
                let mut closed = std::mem::replace(bar, MinuteBar::open_with(tick));
                annotate(&mut closed, recent_prices);
                Some(closed)
            }
        }
    }

    /// Close every open bar (session end / shutdown)
    pub fn flush_all<F>(&mut self, recent_prices: F) -> Vec<MinuteBar>
    where
        F: Fn(&str) -> Vec<f64>,
    {
        let mut bars: Vec<MinuteBar> = self
            .open_bars
            .drain()
            .map(|(symbol, mut bar)| {
                annotate(&mut bar, &recent_prices(&symbol));
                bar
            })
            .collect();
        bars.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        bars
    }

    pub fn open_count(&self) -> usize {
        self.open_bars.len()
    }
}

fn annotate(bar: &mut MinuteBar, recent_prices: &[f64]) {
    let start = recent_prices.len().saturating_sub(20);
    let window = &recent_prices[start..];
    bar.rsi = calculate_rsi(window, RSI_PERIOD);
    bar.ma5 = calculate_sma(window, 5);
    bar.ma20 = calculate_sma(window, 20);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tick_at(min: u32, sec: u32, price: f64) -> Tick {
        Tick::new(
            "005930",
            price,
            10,
            Utc.with_ymd_and_hms(2024, 3, 4, 0, min, sec).unwrap(),
        )
    }

    #[test]
    fn test_next_minute_closes_bar() {
        let mut agg = MinuteAggregator::new();
        assert!(agg.on_tick(&tick_at(1, 0, 100.0), &[]).is_none());
        assert!(agg.on_tick(&tick_at(1, 30, 104.0), &[]).is_none());
        assert!(agg.on_tick(&tick_at(1, 59, 102.0), &[]).is_none());

        let prices: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        let closed = agg.on_tick(&tick_at(2, 5, 103.0), &prices).unwrap();

        assert_eq!(closed.open, 100.0);
        assert_eq!(closed.high, 104.0);
        assert_eq!(closed.close, 102.0);
        assert_eq!(closed.volume, 30);
        assert_eq!(closed.rsi, Some(100.0));
        assert_eq!(closed.ma5, Some(122.0));
        assert!(closed.ma20.is_some());
    }

    #[test]
    fn test_late_tick_ignored() {
        let mut agg = MinuteAggregator::new();
        agg.on_tick(&tick_at(5, 0, 100.0), &[]);
        assert!(agg.on_tick(&tick_at(4, 59, 999.0), &[]).is_none());

        let bars = agg.flush_all(|_| Vec::new());
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].high, 100.0);
        assert_eq!(bars[0].rsi, None);
        assert_eq!(agg.open_count(), 0);
    }
}
