/// Broad-market condition gate
///
/// Classifies the market from two index change rates and the annualised
/// volatility of a proxy ETF:
/// - Crash: either index at or below the crash threshold
/// - HighVolatility: proxy volatility above the threshold
/// - Bullish: both indices above the bullish threshold
/// - Bearish: either index below the bearish threshold
use chrono::{Duration as ChronoDuration, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

use crate::api::{BrokerClient, GatewayError, GatewayResult};
use crate::indicators::annualized_volatility;
use crate::models::MarketCondition;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub primary_index: String,   // KOSPI
    pub secondary_index: String, // KOSDAQ
    pub volatility_proxy: String,
    pub volatility_lookback_days: i64,
    pub crash_threshold_pct: f64,
    pub high_volatility_threshold: f64, // Annualised %
    pub bullish_threshold_pct: f64,
    pub bearish_threshold_pct: f64,
    pub cache_ttl_secs: u64,
    pub fallback_window_secs: u64,
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Quiet period after a failed round of attempts
    pub retry_after_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            primary_index: "0001".to_string(),
            secondary_index: "1001".to_string(),
            volatility_proxy: "069500".to_string(), // KODEX 200
            volatility_lookback_days: 45,
            crash_threshold_pct: -2.0,
            high_volatility_threshold: 35.0,
            bullish_threshold_pct: 1.5,
            bearish_threshold_pct: -1.0,
            cache_ttl_secs: 600,
            fallback_window_secs: 7200,
            call_timeout_secs: 10,
            max_attempts: 3,
            backoff_base_ms: 1000,
            retry_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketAssessment {
    pub condition: MarketCondition,
    pub message: String,
}

/// Pure classification ladder; first match wins
pub fn classify(
    primary_change: f64,
    secondary_change: f64,
    volatility: Option<f64>,
    config: &MarketConfig,
) -> MarketAssessment {
    let worst = primary_change.min(secondary_change);
    let summary = format!(
        "primary {:+.2}%, secondary {:+.2}%, vol {}",
        primary_change,
        secondary_change,
        volatility
            .map(|v| format!("{:.1}%", v))
            .unwrap_or_else(|| "n/a".to_string())
    );

    let condition = if worst <= config.crash_threshold_pct {
        MarketCondition::Crash
    } else if volatility.is_some_and(|v| v > config.high_volatility_threshold) {
        MarketCondition::HighVolatility
    } else if primary_change > config.bullish_threshold_pct
        && secondary_change > config.bullish_threshold_pct
    {
        MarketCondition::Bullish
    } else if worst < config.bearish_threshold_pct {
        MarketCondition::Bearish
    } else {
        MarketCondition::Normal
    };

    MarketAssessment {
        condition,
        message: format!("{} ({})", condition, summary),
    }
}

struct CachedAssessment {
    assessment: MarketAssessment,
    at: Instant,
}

fn unavailable() -> MarketAssessment {
    MarketAssessment {
        condition: MarketCondition::Normal,
        message: "normal (market data unavailable, using default)".to_string(),
    }
}

pub struct MarketConditionGate {
    broker: Arc<dyn BrokerClient>,
    config: MarketConfig,
    last: Mutex<Option<CachedAssessment>>,
    retry_at: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
}

impl MarketConditionGate {
    pub fn new(broker: Arc<dyn BrokerClient>, config: MarketConfig) -> Self {
        Self {
            broker,
            config,
            last: Mutex::new(None),
            retry_at: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Current verdict. Never fails: falls back to a recent cached verdict,
    /// then to `Normal`. After a failed round no broker call is made until
    /// the retry-after period has passed.
    pub async fn assess(&self) -> MarketAssessment {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(cached) = self.cached_within(ttl) {
            return cached;
        }
        if self.backing_off() {
            return self.fallback();
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.fetch_once().await {
                Ok((primary, secondary, volatility)) => {
                    let assessment = classify(primary, secondary, volatility, &self.config);
                    tracing::info!("📊 Market condition: {}", assessment.message);
                    *self.last.lock() = Some(CachedAssessment {
                        assessment: assessment.clone(),
                        at: Instant::now(),
                    });
                    *self.retry_at.lock() = None;
                    return assessment;
                }
                Err(e) if attempt < max_attempts => {
                    let backoff =
                        Duration::from_millis(self.config.backoff_base_ms << (attempt - 1));
                    tracing::warn!(
                        "Market data fetch failed: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::warn!("Market data unavailable after {} attempts: {}", max_attempts, e);
                }
            }
        }

        *self.retry_at.lock() =
            Some(Instant::now() + Duration::from_secs(self.config.retry_after_secs));
        self.fallback()
    }

    /// Verdict without waiting on the broker. A stale verdict triggers one
    /// background refresh; until it lands the last known verdict inside the
    /// fallback window (or the default) is returned.
    pub fn latest(self: &Arc<Self>) -> MarketAssessment {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(cached) = self.cached_within(ttl) {
            return cached;
        }
        if !self.backing_off() && !self.refreshing.swap(true, Ordering::SeqCst) {
            let gate = Arc::clone(self);
            tokio::spawn(async move {
                gate.assess().await;
                gate.refreshing.store(false, Ordering::SeqCst);
            });
        }
        self.fallback()
    }

    fn backing_off(&self) -> bool {
        self.retry_at
            .lock()
            .is_some_and(|at| Instant::now() < at)
    }

    fn fallback(&self) -> MarketAssessment {
        let window = Duration::from_secs(self.config.fallback_window_secs);
        match self.cached_within(window) {
            Some(mut cached) => {
                cached.message = format!("{} [cached]", cached.message);
                cached
            }
            None => unavailable(),
        }
    }

    fn cached_within(&self, max_age: Duration) -> Option<MarketAssessment> {
        self.last
            .lock()
            .as_ref()
            .filter(|c| c.at.elapsed() <= max_age)
            .map(|c| c.assessment.clone())
    }

    async fn bounded<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: std::future::Future<Output = GatewayResult<T>>,
    {
        let limit = Duration::from_secs(self.config.call_timeout_secs);
        timeout(limit, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)))
    }

    /// Both index change rates plus proxy volatility, fetched concurrently.
    /// Volatility is optional: its failure does not fail the attempt.
    async fn fetch_once(&self) -> GatewayResult<(f64, f64, Option<f64>)> {
        let end = Local::now().date_naive();
        let start = end - ChronoDuration::days(self.config.volatility_lookback_days);

        let (primary, secondary, history) = tokio::join!(
            self.bounded(self.broker.get_index(&self.config.primary_index)),
            self.bounded(self.broker.get_index(&self.config.secondary_index)),
            self.bounded(
                self.broker
                    .get_daily_history(&self.config.volatility_proxy, start, end)
            ),
        );

        let volatility = match history {
            Ok(bars) => {
                let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
                annualized_volatility(&closes)
            }
            Err(e) => {
                tracing::debug!("Volatility proxy unavailable: {}", e);
                None
            }
        };

        Ok((primary?.change_pct, secondary?.change_pct, volatility))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::models::DailyBar;
    use chrono::NaiveDate;

    fn config() -> MarketConfig {
        MarketConfig::default()
    }

    #[test]
    fn test_classification_ladder() {
        let c = config();
        assert_eq!(classify(-2.5, 0.3, None, &c).condition, MarketCondition::Crash);
        assert_eq!(classify(0.1, -2.0, Some(80.0), &c).condition, MarketCondition::Crash);
        assert_eq!(
            classify(0.2, 0.1, Some(40.0), &c).condition,
            MarketCondition::HighVolatility
        );
        assert_eq!(classify(1.6, 1.8, Some(12.0), &c).condition, MarketCondition::Bullish);
        assert_eq!(classify(1.6, 0.4, None, &c).condition, MarketCondition::Normal);
        assert_eq!(classify(0.5, -1.2, None, &c).condition, MarketCondition::Bearish);
        assert_eq!(classify(0.0, 0.0, None, &c).condition, MarketCondition::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assessment_cached_for_ttl() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.set_index("0001", 2600.0, 0.3);
        broker.set_index("1001", 850.0, -0.2);
        let gate = MarketConditionGate::new(broker.clone(), config());

        assert_eq!(gate.assess().await.condition, MarketCondition::Normal);
        let calls = broker.call_count();
        gate.assess().await;
        assert_eq!(broker.call_count(), calls);

        tokio::time::advance(Duration::from_secs(601)).await;
        gate.assess().await;
        assert!(broker.call_count() > calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatility_from_proxy_history() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.set_index("0001", 2600.0, 0.3);
        broker.set_index("1001", 850.0, 0.2);

        let today = Local::now().date_naive();
        let bars = (0..30)
            .map(|i| {
                let close = if i % 2 == 0 { 10_000.0 } else { 10_400.0 };
                DailyBar {
                    date: today - ChronoDuration::days(30 - i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1,
                }
            })
            .collect();
        broker.set_daily_history("069500", bars);

        let gate = MarketConditionGate::new(broker, config());
        assert_eq!(gate.assess().await.condition, MarketCondition::HighVolatility);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_recent_verdict_then_default() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.set_index("0001", 2400.0, -3.1);
        broker.set_index("1001", 800.0, -2.4);
        let gate = MarketConditionGate::new(broker.clone(), config());
        assert_eq!(gate.assess().await.condition, MarketCondition::Crash);

        // Outage after the cache TTL but inside the fallback window
        tokio::time::advance(Duration::from_secs(900)).await;
        broker.fail_next_calls(1_000, || GatewayError::Timeout(Duration::from_secs(10)));
        let started = Instant::now();
        let verdict = gate.assess().await;
        assert_eq!(verdict.condition, MarketCondition::Crash);
        assert!(verdict.message.contains("cached"));
        // Backoff of 1s then 2s between three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));

        // Beyond the fallback window the conservative default applies
        tokio::time::advance(Duration::from_secs(7200)).await;
        assert_eq!(gate.assess().await.condition, MarketCondition::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_time_out() {
        struct Stalled;

        #[async_trait::async_trait]
        impl BrokerClient for Stalled {
            async fn get_current_price(&self, _: &str) -> GatewayResult<crate::models::Quote> {
                unimplemented!()
            }
            async fn get_daily_history(
                &self,
                _: &str,
                _: NaiveDate,
                _: NaiveDate,
            ) -> GatewayResult<Vec<DailyBar>> {
                Ok(Vec::new())
            }
            async fn get_balance(&self) -> GatewayResult<crate::models::Balance> {
                unimplemented!()
            }
            async fn place_order(
                &self,
                _: &str,
                _: crate::models::OrderSide,
                _: u64,
                _: crate::models::OrderPrice,
            ) -> GatewayResult<crate::models::OrderAck> {
                unimplemented!()
            }
            async fn get_index(&self, _: &str) -> GatewayResult<crate::models::IndexSnapshot> {
                std::future::pending().await
            }
            async fn get_volume_ranking(&self) -> GatewayResult<Vec<crate::models::RankedStock>> {
                unimplemented!()
            }
            async fn get_financial_ratios(
                &self,
                _: &str,
            ) -> GatewayResult<crate::models::FinancialRatios> {
                unimplemented!()
            }
            async fn stream_approval_key(&self) -> GatewayResult<String> {
                unimplemented!()
            }
        }

        let gate = MarketConditionGate::new(Arc::new(Stalled), config());
        let started = Instant::now();
        let verdict = gate.assess().await;
        assert_eq!(verdict.condition, MarketCondition::Normal);
        // Three 10s timeouts plus 1s and 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(33));
        assert!(started.elapsed() < Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_default_is_cached_until_retry_after() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.fail_next_calls(1_000, || GatewayError::Timeout(Duration::from_secs(10)));
        let gate = MarketConditionGate::new(broker.clone(), config());

        assert_eq!(gate.assess().await.condition, MarketCondition::Normal);
        let calls = broker.call_count();

        let started = Instant::now();
        let verdict = gate.assess().await;
        assert_eq!(verdict.condition, MarketCondition::Normal);
        assert_eq!(broker.call_count(), calls);
        assert_eq!(started.elapsed(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(61)).await;
        gate.assess().await;
        assert!(broker.call_count() > calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_never_waits_and_refreshes_in_background() {
        let broker = Arc::new(PaperBroker::new(0.0));
        broker.set_index("0001", 2400.0, -3.1);
        broker.set_index("1001", 800.0, -2.4);
        let gate = Arc::new(MarketConditionGate::new(broker, config()));

        let started = Instant::now();
        let first = gate.latest();
        assert_eq!(first.condition, MarketCondition::Normal);
        assert_eq!(started.elapsed(), Duration::ZERO);

        // Let the spawned refresh run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.latest().condition, MarketCondition::Crash);
    }
}
