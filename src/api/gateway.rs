use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::broker::BrokerClient;
use super::error::{GatewayError, GatewayResult};
use crate::models::{
    Balance, DailyBar, FinancialRatios, IndexSnapshot, OrderAck, OrderPrice, OrderSide, Quote,
    RankedStock,
};

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub min_interval_ms: u64,
    pub requests_per_second: u32,
    pub cache_ttl_secs: u64,
    pub max_attempts: u32,
    pub rate_limit_backoff_ms: u64, // Multiplied by the attempt number
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            requests_per_second: 2,
            cache_ttl_secs: 300,
            max_attempts: 3,
            rate_limit_backoff_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CachedResponse {
    value: serde_json::Value,
    stored_at: Instant,
}

/// Short-TTL cache of successful read responses keyed by endpoint and parameters
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(endpoint: &str, params: &[&str]) -> String {
        format!("{}?{}", endpoint, params.join("&"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock();
        let hit = entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .and_then(|e| serde_json::from_value(e.value.clone()).ok());

        match hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn put<T: Serialize>(&self, key: String, value: &T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.entries.lock().insert(
                key,
                CachedResponse {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

/// Single funnel for every broker call.
///
/// All callers share one limiter (per-second quota plus minimum spacing),
/// idempotent reads are served from a short-TTL cache, and rate-limit or
/// transient failures back off before the next attempt. Orders are never
/// cached and are only retried when the broker throttled them outright.
pub struct RateLimitedGateway {
    inner: Arc<dyn BrokerClient>,
    config: GatewayConfig,
    limiter: Option<DirectRateLimiter>,
    last_call: tokio::sync::Mutex<Option<Instant>>,
    cache: ResponseCache,
}

impl RateLimitedGateway {
    pub fn new(inner: Arc<dyn BrokerClient>, config: GatewayConfig) -> Self {
        let limiter = NonZeroU32::new(config.requests_per_second)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));
        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl_secs));

        tracing::info!(
            "Gateway initialised ({} req/s, {}ms spacing, {}s cache)",
            config.requests_per_second,
            config.min_interval_ms,
            config.cache_ttl_secs
        );

        Self {
            inner,
            config,
            limiter,
            last_call: tokio::sync::Mutex::new(None),
            cache,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Wait for a slot. The guard is held across both waits so spacing is
    /// enforced no matter how many tasks call concurrently.
    async fn acquire(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let spacing = Duration::from_millis(self.config.min_interval_ms);
        if let Some(previous) = *last {
            let ready_at = previous + spacing;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn call<T, F, Fut>(&self, label: &str, retry_all_transient: bool, op: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.acquire().await;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable = match &err {
                GatewayError::RateLimited => true,
                other => retry_all_transient && other.is_transient(),
            };
            if !retryable || attempt >= max_attempts {
                return Err(err);
            }

            let backoff = Duration::from_millis(self.config.rate_limit_backoff_ms * attempt as u64);
            tracing::warn!(
                "{} failed: {}, retrying in {:?} (attempt {}/{})",
                label,
                err,
                backoff,
                attempt,
                max_attempts
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn cached<T, F, Fut>(&self, key: String, label: &str, op: F) -> GatewayResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        if let Some(hit) = self.cache.get::<T>(&key) {
            return Ok(hit);
        }
        let value = self.call(label, true, op).await?;
        self.cache.put(key, &value);
        Ok(value)
    }
}

#[async_trait]
impl BrokerClient for RateLimitedGateway {
    /// Quotes feed trading decisions and bypass the cache
    async fn get_current_price(&self, symbol: &str) -> GatewayResult<Quote> {
        self.call("get_current_price", true, || self.inner.get_current_price(symbol))
            .await
    }

    async fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> GatewayResult<Vec<DailyBar>> {
        let key = ResponseCache::key(
            "daily_history",
            &[symbol, &start.to_string(), &end.to_string()],
        );
        self.cached(key, "get_daily_history", || {
            self.inner.get_daily_history(symbol, start, end)
        })
        .await
    }

    async fn get_balance(&self) -> GatewayResult<Balance> {
        self.call("get_balance", true, || self.inner.get_balance()).await
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: OrderPrice,
    ) -> GatewayResult<OrderAck> {
        self.call("place_order", false, || {
            self.inner.place_order(symbol, side, quantity, price)
        })
        .await
    }

    async fn get_index(&self, code: &str) -> GatewayResult<IndexSnapshot> {
        let key = ResponseCache::key("index", &[code]);
        self.cached(key, "get_index", || self.inner.get_index(code)).await
    }

    async fn get_volume_ranking(&self) -> GatewayResult<Vec<RankedStock>> {
        let key = ResponseCache::key("volume_ranking", &[]);
        self.cached(key, "get_volume_ranking", || self.inner.get_volume_ranking())
            .await
    }

    async fn get_financial_ratios(&self, symbol: &str) -> GatewayResult<FinancialRatios> {
        let key = ResponseCache::key("financial_ratios", &[symbol]);
        self.cached(key, "get_financial_ratios", || {
            self.inner.get_financial_ratios(symbol)
        })
        .await
    }

    async fn stream_approval_key(&self) -> GatewayResult<String> {
        self.call("stream_approval_key", true, || self.inner.stream_approval_key())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::paper::PaperBroker;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            min_interval_ms: 500,
            requests_per_second: 0,
            cache_ttl_secs: 300,
            max_attempts: 3,
            rate_limit_backoff_ms: 1500,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_between_calls() {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.set_price("005930", 70_000.0);
        let gateway = RateLimitedGateway::new(broker.clone(), fast_config());

        let start = Instant::now();
        for _ in 0..3 {
            gateway.get_current_price("005930").await.unwrap();
        }
        // Two gaps of 500ms between three calls
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(broker.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_served_from_cache() {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.set_index("0001", 2650.0, 0.4);
        let gateway = RateLimitedGateway::new(broker.clone(), fast_config());

        let first = gateway.get_index("0001").await.unwrap();
        let second = gateway.get_index("0001").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.call_count(), 1);

        let stats = gateway.cache().stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(gateway.cache().clear_expired(), 1);
        gateway.get_index("0001").await.unwrap();
        assert_eq!(broker.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backs_off_then_succeeds() {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.set_price("005930", 70_000.0);
        broker.fail_next_calls(2, || GatewayError::RateLimited);
        let gateway = RateLimitedGateway::new(broker.clone(), fast_config());

        let start = Instant::now();
        let quote = gateway.get_current_price("005930").await.unwrap();
        assert_eq!(quote.price, 70_000.0);
        // 1.5s then 3.0s of backoff
        assert!(start.elapsed() >= Duration::from_millis(4500));
        assert_eq!(broker.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.set_index("0001", 2650.0, 0.4);
        broker.fail_next_calls(1, || GatewayError::Malformed("bad".into()));
        let gateway = RateLimitedGateway::new(broker.clone(), fast_config());

        assert!(gateway.get_index("0001").await.is_err());
        assert_eq!(gateway.cache().stats().entries, 0);
        assert!(gateway.get_index("0001").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orders_not_retried_on_timeout() {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.set_price("005930", 70_000.0);
        broker.fail_next_calls(1, || GatewayError::Timeout(Duration::from_secs(5)));
        let gateway = RateLimitedGateway::new(broker.clone(), fast_config());

        let result = gateway
            .place_order("005930", OrderSide::Buy, 1, OrderPrice::Market)
            .await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert_eq!(broker.call_count(), 1);
    }
}
