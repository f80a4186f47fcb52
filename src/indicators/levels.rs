/// Support (min) and resistance (max) over the trailing `window` prices.
/// Uses whatever is available when the history is shorter than the window.
pub fn support_resistance(prices: &[f64], window: usize) -> Option<(f64, f64)> {
    if prices.is_empty() || window == 0 {
        return None;
    }

    let start = prices.len().saturating_sub(window);
    let slice = &prices[start..];

    let support = slice.iter().copied().fold(f64::INFINITY, f64::min);
    let resistance = slice.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some((support, resistance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_window_only() {
        let prices = vec![50.0, 200.0, 100.0, 101.0, 99.0, 102.0];
        assert_eq!(support_resistance(&prices, 4), Some((99.0, 102.0)));
    }

    #[test]
    fn test_short_history() {
        assert_eq!(support_resistance(&[10.0, 12.0], 20), Some((10.0, 12.0)));
        assert_eq!(support_resistance(&[], 20), None);
    }
}
