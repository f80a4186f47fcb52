use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::RankedStock;

const EXCLUDED_NAME_MARKERS: [&str; 5] = ["ETF", "ETN", "KODEX", "TIGER", "KBSTAR"];

/// Liquidity/activity filters for choosing which symbols to watch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub max_targets: usize,
    pub min_price: f64,
    pub max_price: f64,
    pub min_volume: u64,
    pub min_abs_change_pct: f64,
    pub max_abs_change_pct: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_targets: 10,
            min_price: 5_000.0,
            max_price: 100_000.0,
            min_volume: 1_000_000,
            min_abs_change_pct: 1.0,  // Needs some movement
            max_abs_change_pct: 30.0, // Limit-up/limit-down names are untradeable
        }
    }
}

/// Picks the most active tradeable stocks from the broker's volume ranking
#[derive(Debug, Clone, Default)]
pub struct TargetSelector {
    config: SelectorConfig,
}

impl TargetSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Plain listed common stock: six digits, not a fund or a special issue
    pub fn is_tradeable(stock: &RankedStock) -> bool {
        let code = stock.symbol.as_str();
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if code.starts_with('9') || code.starts_with('Q') {
            return false;
        }
        !EXCLUDED_NAME_MARKERS
            .iter()
            .any(|marker| stock.name.contains(marker))
    }

    pub fn passes_filters(&self, stock: &RankedStock) -> bool {
        let change = stock.change_pct.abs();
        Self::is_tradeable(stock)
            && stock.price >= self.config.min_price
            && stock.price <= self.config.max_price
            && stock.volume > self.config.min_volume
            && change > self.config.min_abs_change_pct
            && change <= self.config.max_abs_change_pct
    }

    /// volume × |change| with a mild penalty for very cheap or expensive names
    pub fn activity_score(stock: &RankedStock) -> f64 {
        let factor = if stock.price < 10_000.0 {
            0.8
        } else if stock.price > 50_000.0 {
            0.9
        } else {
            1.0
        };
        stock.volume as f64 * stock.change_pct.abs() * factor
    }

    /// Top-N symbols by activity score, unioned with `held` so that open
    /// positions keep streaming even after they drop out of the ranking
    pub fn select(&self, ranking: &[RankedStock], held: &[String]) -> Vec<String> {
        let mut candidates: Vec<&RankedStock> =
            ranking.iter().filter(|s| self.passes_filters(s)).collect();

        candidates.sort_by(|a, b| Self::activity_score(b).total_cmp(&Self::activity_score(a)));

        let mut targets: Vec<String> = candidates
            .into_iter()
            .take(self.config.max_targets)
            .map(|s| s.symbol.clone())
            .collect();

        let chosen: BTreeSet<String> = targets.iter().cloned().collect();
        for symbol in held {
            if !chosen.contains(symbol) {
                targets.push(symbol.clone());
            }
        }

        tracing::debug!(
            "Selected {} targets from {} ranked stocks",
            targets.len(),
            ranking.len()
        );
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(symbol: &str, name: &str, price: f64, volume: u64, change: f64) -> RankedStock {
        RankedStock {
            symbol: symbol.to_string(),
            name: name.to_string(),
            price,
            volume,
            change_pct: change,
        }
    }

    #[test]
    fn test_excludes_funds_and_special_codes() {
        assert!(!TargetSelector::is_tradeable(&stock("069500", "KODEX 200", 30000.0, 5_000_000, 2.0)));
        assert!(!TargetSelector::is_tradeable(&stock("900100", "Foreign Co", 30000.0, 5_000_000, 2.0)));
        assert!(!TargetSelector::is_tradeable(&stock("00593", "Short", 30000.0, 5_000_000, 2.0)));
        assert!(TargetSelector::is_tradeable(&stock("005930", "Samsung", 70000.0, 5_000_000, 2.0)));
    }

    #[test]
    fn test_filters_and_ranks() {
        let selector = TargetSelector::new(SelectorConfig {
            max_targets: 2,
            ..Default::default()
        });
        let ranking = vec![
            stock("000001", "Quiet", 20_000.0, 2_000_000, 0.5), // too little movement
            stock("000002", "Limit Up", 20_000.0, 9_000_000, 29.9),
            stock("000003", "Active", 20_000.0, 3_000_000, 5.0),
            stock("000004", "Cheap", 6_000.0, 3_000_000, 5.0), // 0.8 factor
            stock("000005", "Thin", 20_000.0, 500_000, 8.0),   // volume too low
        ];

        let targets = selector.select(&ranking, &[]);
        assert_eq!(targets, vec!["000002".to_string(), "000003".to_string()]);
    }

    #[test]
    fn test_held_symbols_are_kept() {
        let selector = TargetSelector::default();
        let ranking = vec![stock("000003", "Active", 20_000.0, 3_000_000, 5.0)];
        let held = vec!["000003".to_string(), "035720".to_string()];

        let targets = selector.select(&ranking, &held);
        assert_eq!(targets, vec!["000003".to_string(), "035720".to_string()]);
    }
}
