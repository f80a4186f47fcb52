/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential Moving Average series, one value per input price.
///
/// The first value is seeded with the raw first price (not an SMA), then
/// `ema[i] = α·price[i] + (1-α)·ema[i-1]` with `α = 2/(period+1)`.
///
/// When there are fewer prices than `period` the result is a flat series at
/// the simple mean of what is available.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    if period == 0 || prices.len() < period {
        let mean = prices.iter().sum::<f64>() / prices.len() as f64;
        return vec![mean; prices.len()];
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(prices.len());
    let mut ema = prices[0];
    series.push(ema);

    for price in &prices[1..] {
        ema = alpha * price + (1.0 - alpha) * ema;
        series.push(ema);
    }

    series
}

/// Latest EMA value (see [`ema_series`])
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    ema_series(prices, period).last().copied()
}
