use super::moving_average::ema_series;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
}

impl Macd {
    pub fn histogram(&self) -> f64 {
        self.line - self.signal
    }
}

/// MACD line and signal line at the latest point.
///
/// `line = ema(fast) - ema(slow)`; `signal = ema(line series, signal_period)`.
/// The line series starts once the slow EMA has `slow` inputs behind it. With
/// fewer than `slow` prices the EMAs take their flat-mean fallback and every
/// point counts. If the line series is shorter than `signal_period`, the
/// signal equals the line. Returns `None` only for an empty series.
pub fn calculate_macd(prices: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    let fast_ema = ema_series(prices, fast);
    let slow_ema = ema_series(prices, slow);
    let warmup = if prices.len() >= slow { slow.saturating_sub(1) } else { 0 };

    let line_series: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .skip(warmup)
        .map(|(f, s)| f - s)
        .collect();

    let line = *line_series.last()?;

    let signal = if line_series.len() < signal_period {
        line
    } else {
        *ema_series(&line_series, signal_period).last()?
    };

    Some(Macd { line, signal })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macd_empty() {
        assert!(calculate_macd(&[], 12, 26, 9).is_none());
    }

    #[test]
    fn test_macd_short_history_uses_mean_fallback() {
        // 20 prices: fast EMA is real, slow EMA falls back to the mean of 110.5
        let prices: Vec<f64> = (0..20).map(|i| 101.0 + i as f64).collect();
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        let fast = *ema_series(&prices, 12).last().unwrap();
        assert!((macd.line - (fast - 110.5)).abs() < 1e-9);
        assert!(macd.line > 0.0);

        // Too short for both EMAs and the signal: flat means cancel out
        let macd = calculate_macd(&prices[..5], 12, 26, 9).unwrap();
        assert_eq!(macd.line, 0.0);
        assert_eq!(macd.signal, 0.0);
    }

    #[test]
    fn test_macd_flat_prices_is_zero() {
        let prices = vec![100.0; 60];
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert!(macd.line.abs() < 1e-9);
        assert!(macd.signal.abs() < 1e-9);
    }

    #[test]
    fn test_macd_uptrend_positive() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert!(macd.line > 0.0);
    }

    #[test]
    fn test_macd_short_signal_history_uses_line() {
        // 30 prices -> 5 line values, fewer than the 9 needed for the signal EMA
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let macd = calculate_macd(&prices, 12, 26, 9).unwrap();
        assert_eq!(macd.line, macd.signal);
        assert_eq!(macd.histogram(), 0.0);
    }
}
