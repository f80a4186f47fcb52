use serde::{Deserialize, Serialize};

use crate::indicators::{
    calculate_bollinger, calculate_macd, calculate_rsi, calculate_sma, support_resistance,
    volatility_ratio, BollingerBands, Macd,
};
use crate::models::MarketCondition;

/// Relative weight of each buy-score component (conceptually summing to 100)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub rsi: f64,
    pub macd: f64,
    pub bollinger: f64,
    pub volume: f64,
    pub trend: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            rsi: 30.0,
            macd: 25.0,
            bollinger: 20.0,
            volume: 15.0,
            trend: 10.0,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.rsi + self.macd + self.bollinger + self.volume + self.trend
    }
}

/// Configuration for signal scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub min_history: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    pub volume_avg_period: usize,
    pub volume_multiplier: f64, // Veto below this multiple of the trailing average
    pub weights: SignalWeights,
    pub min_signal_score: f64,
    pub min_target_profit_rate: f64, // Fraction, e.g. 0.008 = 0.8%
    pub round_trip_fee_rate: f64,    // Assumed when estimating potential return
    pub volatility_threshold: f64,   // Short/long volatility ratio that vetoes entries
    pub volatility_short_window: usize,
    pub volatility_long_window: usize,
    pub resistance_window: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_history: 20,
            rsi_period: 14,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_k: 2.0,
            volume_avg_period: 20,
            volume_multiplier: 1.5,
            weights: SignalWeights::default(),
            min_signal_score: 60.0,
            min_target_profit_rate: 0.008, // 0.8%
            round_trip_fee_rate: 0.0027,   // 0.015% x2 + 0.23% tax, rounded up
            volatility_threshold: 2.0,
            volatility_short_window: 5,
            volatility_long_window: 20,
            resistance_window: 20,
        }
    }
}

/// Point-in-time indicator values for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub rsi: Option<f64>,
    pub macd: Option<Macd>,
    pub bands: BollingerBands,
    pub volume_ratio: f64,
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
}

impl IndicatorSnapshot {
    /// `None` when there are no prices at all
    pub fn compute(prices: &[f64], volumes: &[f64], config: &SignalConfig) -> Option<Self> {
        let price = *prices.last()?;
        let bands = calculate_bollinger(prices, config.bollinger_period, config.bollinger_k)?;

        Some(Self {
            price,
            rsi: calculate_rsi(prices, config.rsi_period),
            macd: calculate_macd(prices, config.macd_fast, config.macd_slow, config.macd_signal),
            bands,
            volume_ratio: volume_ratio(volumes, config.volume_avg_period),
            ma5: calculate_sma(prices, 5),
            ma10: calculate_sma(prices, 10),
            ma20: calculate_sma(prices, 20),
        })
    }
}

/// Latest volume relative to the mean of the `period` volumes before it.
/// 0.0 when there is no usable baseline.
pub fn volume_ratio(volumes: &[f64], period: usize) -> f64 {
    if volumes.len() < 2 || period == 0 {
        return 0.0;
    }

    let (latest, before) = volumes.split_at(volumes.len() - 1);
    let start = before.len().saturating_sub(period);
    let baseline = &before[start..];
    let avg = baseline.iter().sum::<f64>() / baseline.len() as f64;

    if avg <= 0.0 {
        return 0.0;
    }
    latest[0] / avg
}

/// Weighted 0..100 buy score with the reasons that contributed
#[derive(Debug, Clone, PartialEq)]
pub struct BuyScore {
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Bounded point count (0..=5) for exits
#[derive(Debug, Clone, PartialEq)]
pub struct SellScore {
    pub points: u8,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuyDecision {
    pub approved: bool,
    pub reason: String,
    pub score: f64,
}

impl BuyDecision {
    fn veto(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            score: 0.0,
        }
    }
}

pub fn rsi_subscore(rsi: f64) -> f64 {
    if rsi < 25.0 {
        100.0
    } else if rsi < 30.0 {
        80.0
    } else if rsi < 40.0 {
        60.0
    } else if rsi < 50.0 {
        30.0
    } else if rsi <= 60.0 {
        20.0
    } else {
        0.0
    }
}

pub fn macd_subscore(macd: &Macd) -> f64 {
    let diff = macd.histogram();
    let above = macd.line > macd.signal;

    if above && macd.line > 0.0 && diff > 0.5 {
        100.0
    } else if above && macd.line > 0.0 {
        80.0
    } else if above && diff > 0.2 {
        60.0
    } else if above {
        40.0
    } else {
        0.0
    }
}

pub fn bollinger_subscore(position: f64) -> f64 {
    if position <= 0.05 {
        100.0
    } else if position <= 0.10 {
        80.0
    } else if position <= 0.20 {
        50.0
    } else if position <= 0.50 {
        20.0
    } else {
        0.0
    }
}

pub fn volume_subscore(ratio: f64) -> f64 {
    if ratio > 3.0 {
        100.0
    } else if ratio > 2.5 {
        80.0
    } else if ratio > 2.0 {
        60.0
    } else if ratio >= 1.5 {
        40.0
    } else {
        0.0
    }
}

pub fn trend_subscore(price: f64, ma5: f64, ma10: f64, ma20: f64) -> f64 {
    if price > ma5 && ma5 > ma10 && ma10 > ma20 {
        100.0
    } else if price > ma5 && ma5 > ma20 {
        70.0
    } else if ma5 > ma20 {
        40.0
    } else if ma20 > 0.0 && ((ma5 - ma20) / ma20).abs() < 0.002 {
        20.0
    } else {
        0.0
    }
}

/// Stateless multi-indicator scorer
#[derive(Debug, Clone, Default)]
pub struct SignalScorer {
    config: SignalConfig,
}

impl SignalScorer {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Weighted buy score. Insufficient history or a volume below the
    /// configured multiple of its trailing average short-circuit to 0.
    pub fn score_buy(&self, prices: &[f64], volumes: &[f64]) -> BuyScore {
        if prices.len() < self.config.min_history {
            return BuyScore {
                score: 0.0,
                reasons: vec!["insufficient data".to_string()],
            };
        }

        let Some(snapshot) = IndicatorSnapshot::compute(prices, volumes, &self.config) else {
            return BuyScore {
                score: 0.0,
                reasons: vec!["insufficient data".to_string()],
            };
        };

        if snapshot.volume_ratio < self.config.volume_multiplier {
            return BuyScore {
                score: 0.0,
                reasons: vec![format!(
                    "volume {:.2}x below required {:.2}x",
                    snapshot.volume_ratio, self.config.volume_multiplier
                )],
            };
        }

        self.score_snapshot(&snapshot)
    }

    /// Weighted sum of the component ladders for a precomputed snapshot
    pub fn score_snapshot(&self, s: &IndicatorSnapshot) -> BuyScore {
        let w = &self.config.weights;
        let mut reasons = Vec::new();

        // Undefined RSI counts as neutral
        let rsi = s.rsi.unwrap_or(50.0);
        let rsi_score = rsi_subscore(rsi);
        if rsi_score > 0.0 {
            reasons.push(format!("RSI {:.1} ({:.0})", rsi, rsi_score));
        }

        let macd_score = s.macd.as_ref().map(macd_subscore).unwrap_or(0.0);
        if macd_score > 0.0 {
            reasons.push(format!("MACD above signal ({:.0})", macd_score));
        }

        let position = s.bands.position(s.price);
        let bb_score = bollinger_subscore(position);
        if bb_score > 0.0 {
            reasons.push(format!("Bollinger position {:.2} ({:.0})", position, bb_score));
        }

        let vol_score = volume_subscore(s.volume_ratio);
        if vol_score > 0.0 {
            reasons.push(format!("volume {:.2}x ({:.0})", s.volume_ratio, vol_score));
        }

        let trend_score = match (s.ma5, s.ma10, s.ma20) {
            (Some(ma5), Some(ma10), Some(ma20)) => trend_subscore(s.price, ma5, ma10, ma20),
            _ => 0.0,
        };
        if trend_score > 0.0 {
            reasons.push(format!("trend alignment ({:.0})", trend_score));
        }

        let score = (rsi_score * w.rsi
            + macd_score * w.macd
            + bb_score * w.bollinger
            + vol_score * w.volume
            + trend_score * w.trend)
            / 100.0;

        BuyScore { score, reasons }
    }

    /// One point per bearish condition
    pub fn score_sell(&self, prices: &[f64], volumes: &[f64]) -> SellScore {
        let Some(s) = IndicatorSnapshot::compute(prices, volumes, &self.config) else {
            return SellScore {
                points: 0,
                reasons: vec!["insufficient data".to_string()],
            };
        };

        let mut reasons = Vec::new();

        if let Some(rsi) = s.rsi {
            if rsi > self.config.rsi_overbought {
                reasons.push(format!("RSI overbought {:.1}", rsi));
            }
        }
        if let Some(macd) = s.macd {
            if macd.line < macd.signal && macd.line < 0.0 {
                reasons.push("MACD dead cross".to_string());
            }
        }
        if s.price >= s.bands.upper {
            reasons.push("upper band touch".to_string());
        }
        if volumes.len() > 1 && s.volume_ratio < 0.5 {
            reasons.push(format!("volume fading {:.2}x", s.volume_ratio));
        }
        if let (Some(ma5), Some(ma20)) = (s.ma5, s.ma20) {
            if s.price < ma5 && ma5 < ma20 {
                reasons.push("bearish MA alignment".to_string());
            }
        }

        SellScore {
            points: reasons.len() as u8,
            reasons,
        }
    }

    /// Estimated upside to the nearer of resistance and the upper band,
    /// net of the assumed round-trip fee, floored at zero
    pub fn potential_return(&self, prices: &[f64]) -> Option<f64> {
        let price = *prices.last()?;
        if price <= 0.0 {
            return None;
        }

        let (_, resistance) = support_resistance(prices, self.config.resistance_window)?;
        let bands =
            calculate_bollinger(prices, self.config.bollinger_period, self.config.bollinger_k)?;
        let target = resistance.min(bands.upper);

        Some((target / price - 1.0 - self.config.round_trip_fee_rate).max(0.0))
    }

    pub fn should_buy(
        &self,
        prices: &[f64],
        volumes: &[f64],
        condition: MarketCondition,
    ) -> BuyDecision {
        if condition.blocks_entries() {
            return BuyDecision::veto(format!("market condition {}", condition));
        }

        if prices.len() < self.config.min_history {
            return BuyDecision::veto(format!(
                "insufficient data ({}/{})",
                prices.len(),
                self.config.min_history
            ));
        }

        let vol_ratio = volatility_ratio(
            prices,
            self.config.volatility_short_window,
            self.config.volatility_long_window,
        );
        if vol_ratio > self.config.volatility_threshold {
            return BuyDecision::veto(format!(
                "volatility spike {:.2}x > {:.2}x",
                vol_ratio, self.config.volatility_threshold
            ));
        }

        let potential = self.potential_return(prices).unwrap_or(0.0);
        if potential < self.config.min_target_profit_rate {
            return BuyDecision::veto(format!(
                "potential return {:.2}% below target {:.2}%",
                potential * 100.0,
                self.config.min_target_profit_rate * 100.0
            ));
        }

        let buy = self.score_buy(prices, volumes);
        tracing::debug!(
            "Buy score {:.1} (min {:.1}): {}",
            buy.score,
            self.config.min_signal_score,
            buy.reasons.join(", ")
        );

        if buy.score >= self.config.min_signal_score {
            BuyDecision {
                approved: true,
                reason: format!("score {:.1}: {}", buy.score, buy.reasons.join(", ")),
                score: buy.score,
            }
        } else {
            BuyDecision {
                approved: false,
                reason: format!(
                    "score {:.1} below {:.1}",
                    buy.score, self.config.min_signal_score
                ),
                score: buy.score,
            }
        }
    }
}
