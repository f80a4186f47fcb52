use super::volatility::population_std_dev;

/// Mean ± k·σ envelope over a trailing window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

impl BollingerBands {
    /// Where `price` sits inside the band: 0 at the lower band, 1 at the upper.
    /// A zero-width band is treated as neutral (0.5).
    pub fn position(&self, price: f64) -> f64 {
        let width = self.upper - self.lower;
        if width <= f64::EPSILON {
            return 0.5;
        }
        (price - self.lower) / width
    }
}

/// Bollinger Bands using the population standard deviation.
///
/// With fewer than `period` prices a placeholder band of ±5% around the last
/// price is returned. `None` only for an empty input.
pub fn calculate_bollinger(prices: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    let last = *prices.last()?;

    if period == 0 || prices.len() < period {
        return Some(BollingerBands {
            lower: last * 0.95,
            middle: last,
            upper: last * 1.05,
        });
    }

    let window = &prices[prices.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let std_dev = population_std_dev(window)?;

    Some(BollingerBands {
        lower: mean - k * std_dev,
        middle: mean,
        upper: mean + k * std_dev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bollinger_placeholder_band() {
        let bands = calculate_bollinger(&[100.0, 101.0, 102.0], 20, 2.0).unwrap();
        assert!((bands.lower - 96.9).abs() < 1e-9);
        assert!((bands.upper - 107.1).abs() < 1e-9);
    }

    #[test]
    fn test_bollinger_known_values() {
        // mean 5, population std dev 2
        let prices = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bands = calculate_bollinger(&prices, 8, 2.0).unwrap();
        assert_eq!(bands.middle, 5.0);
        assert_eq!(bands.lower, 1.0);
        assert_eq!(bands.upper, 9.0);
    }

    #[test]
    fn test_position_zero_width_is_neutral() {
        let bands = calculate_bollinger(&vec![100.0; 20], 20, 2.0).unwrap();
        assert_eq!(bands.position(100.0), 0.5);
    }

    #[test]
    fn test_position_at_lower_band() {
        let bands = BollingerBands {
            lower: 90.0,
            middle: 100.0,
            upper: 110.0,
        };
        assert_eq!(bands.position(90.0), 0.0);
        assert_eq!(bands.position(110.0), 1.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(calculate_bollinger(&[], 20, 2.0).is_none());
    }
}
