/// Population standard deviation (`None` for an empty slice)
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some(variance.sqrt())
}

/// Standard deviation relative to the mean
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    if mean == 0.0 {
        return None;
    }
    population_std_dev(values).map(|sd| sd / mean)
}

/// Short-term volatility relative to the preceding regime.
///
/// Compares the coefficient of variation of the last `short` prices with that
/// of the prices before them (up to `long` of them). Returns 1.0 (neutral)
/// when there are fewer than `short + long` prices or the baseline is flat.
pub fn volatility_ratio(prices: &[f64], short: usize, long: usize) -> f64 {
    if short == 0 || long == 0 || prices.len() < short + long {
        return 1.0;
    }

    let split = prices.len() - short;
    let recent = &prices[split..];
    let baseline = &prices[split - long..split];

    match (coefficient_of_variation(recent), coefficient_of_variation(baseline)) {
        (Some(r), Some(b)) if b > 0.0 => r / b,
        _ => 1.0,
    }
}

/// Annualised volatility in percent from daily closes
/// (σ of daily % returns × √252). `None` with fewer than 3 closes.
pub fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 3 {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect();

    population_std_dev(&returns).map(|sd| sd * 252f64.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_dev() {
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(population_std_dev(&values), Some(2.0));
        assert_eq!(population_std_dev(&[]), None);
    }

    #[test]
    fn test_volatility_ratio_neutral_when_short() {
        assert_eq!(volatility_ratio(&[100.0; 10], 5, 25), 1.0);
    }

    #[test]
    fn test_volatility_ratio_detects_spike() {
        let mut prices: Vec<f64> = (0..25).map(|i| 100.0 + (i % 2) as f64 * 0.5).collect();
        prices.extend([100.0, 110.0, 95.0, 112.0, 90.0]);
        assert!(volatility_ratio(&prices, 5, 25) > 2.0);
    }

    #[test]
    fn test_annualized_volatility_flat_is_zero() {
        assert_eq!(annualized_volatility(&[100.0; 20]), Some(0.0));
        assert!(annualized_volatility(&[100.0, 101.0]).is_none());
    }
}
