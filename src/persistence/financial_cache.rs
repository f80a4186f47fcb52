use chrono::{DateTime, Duration, Utc};

use crate::api::BrokerClient;
use crate::db::SqliteStorage;
use crate::models::FinancialRatios;
use crate::Result;

/// Persisted fundamentals with a freshness TTL and a stale-but-usable band
/// of twice the TTL for fallback when the broker is unavailable.
#[derive(Clone)]
pub struct FinancialMetricCache {
    storage: SqliteStorage,
    ttl: Duration,
}

impl FinancialMetricCache {
    pub fn new(storage: SqliteStorage, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, symbol: &str, metric: &str) -> Result<Option<f64>> {
        self.get_at(symbol, metric, Utc::now()).await
    }

    /// Value cached within the TTL as of `now`
    pub async fn get_at(&self, symbol: &str, metric: &str, now: DateTime<Utc>) -> Result<Option<f64>> {
        self.lookup(symbol, metric, now, self.ttl).await
    }

    pub async fn get_stale(&self, symbol: &str, metric: &str) -> Result<Option<f64>> {
        self.get_stale_at(symbol, metric, Utc::now()).await
    }

    /// Value cached within the extended band as of `now`
    pub async fn get_stale_at(
        &self,
        symbol: &str,
        metric: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        self.lookup(symbol, metric, now, self.ttl * 2).await
    }

    async fn lookup(
        &self,
        symbol: &str,
        metric: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Option<f64>> {
        Ok(self
            .storage
            .get_metric(symbol, metric)
            .await?
            .filter(|(_, cached_at)| now - *cached_at <= max_age)
            .map(|(value, _)| value))
    }

    pub async fn put(&self, symbol: &str, metric: &str, value: f64) -> Result<()> {
        self.put_at(symbol, metric, value, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        symbol: &str,
        metric: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.storage.put_metric(symbol, metric, value, now).await
    }

    /// Store every present ratio
    pub async fn put_ratios(&self, symbol: &str, ratios: &FinancialRatios) -> Result<usize> {
        let metrics = ratios.metrics();
        for (name, value) in &metrics {
            self.put(symbol, name, *value).await?;
        }
        Ok(metrics.len())
    }

    /// Ratios assembled from the cache, fresh only or including the stale band
    pub async fn ratios(&self, symbol: &str, allow_stale: bool) -> Result<Option<FinancialRatios>> {
        let mut ratios = FinancialRatios::default();
        let mut found = false;

        for name in ["per", "pbr", "eps", "bps"] {
            let value = if allow_stale {
                self.get_stale(symbol, name).await?
            } else {
                self.get(symbol, name).await?
            };
            found |= value.is_some();
            match name {
                "per" => ratios.per = value,
                "pbr" => ratios.pbr = value,
                "eps" => ratios.eps = value,
                _ => ratios.bps = value,
            }
        }

        Ok(found.then_some(ratios))
    }

    /// Fresh cache, then the broker, then the stale band
    pub async fn fetch_through(
        &self,
        broker: &dyn BrokerClient,
        symbol: &str,
    ) -> Result<Option<FinancialRatios>> {
        if let Some(ratios) = self.ratios(symbol, false).await? {
            return Ok(Some(ratios));
        }

        match broker.get_financial_ratios(symbol).await {
            Ok(ratios) => {
                self.put_ratios(symbol, &ratios).await?;
                Ok(Some(ratios))
            }
            Err(e) => {
                tracing::warn!("Financial ratios for {} unavailable ({}), trying stale cache", symbol, e);
                self.ratios(symbol, true).await
            }
        }
    }

    /// Remove rows older than the extended band
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self
            .storage
            .delete_metrics_before(Utc::now() - self.ttl * 2)
            .await?;
        if removed > 0 {
            tracing::info!("Removed {} expired financial metrics", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> (FinancialMetricCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::connect(dir.path().join("fin.db")).await.unwrap();
        (FinancialMetricCache::new(storage, Duration::hours(24)), dir)
    }

    #[tokio::test]
    async fn test_fresh_and_stale_bands() {
        let (cache, _dir) = cache().await;
        let t0 = Utc::now();
        cache.put_at("005930", "per", 13.2, t0).await.unwrap();

        assert_eq!(cache.get_at("005930", "per", t0).await.unwrap(), Some(13.2));

        let later = t0 + Duration::hours(30);
        assert_eq!(cache.get_at("005930", "per", later).await.unwrap(), None);
        assert_eq!(
            cache.get_stale_at("005930", "per", later).await.unwrap(),
            Some(13.2)
        );

        let much_later = t0 + Duration::hours(49);
        assert_eq!(
            cache.get_stale_at("005930", "per", much_later).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_ratios_round_trip_and_cleanup() {
        let (cache, _dir) = cache().await;
        let ratios = FinancialRatios {
            per: Some(10.0),
            pbr: Some(1.1),
            eps: None,
            bps: Some(50_000.0),
        };
        assert_eq!(cache.put_ratios("000660", &ratios).await.unwrap(), 3);
        assert_eq!(cache.ratios("000660", false).await.unwrap(), Some(ratios));
        assert_eq!(cache.ratios("999999", true).await.unwrap(), None);

        cache
            .put_at("035720", "per", 40.0, Utc::now() - Duration::days(3))
            .await
            .unwrap();
        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_through_falls_back_to_stale() {
        use crate::api::{GatewayError, PaperBroker};

        let (cache, _dir) = cache().await;
        let paper = PaperBroker::new(1_000_000.0);
        paper.set_ratios(
            "005930",
            FinancialRatios {
                per: Some(12.5),
                ..Default::default()
            },
        );

        let fetched = cache.fetch_through(&paper, "005930").await.unwrap();
        assert_eq!(fetched.and_then(|r| r.per), Some(12.5));
        assert_eq!(cache.get("005930", "per").await.unwrap(), Some(12.5));

        // Stale row only; broker down
        cache
            .put_at("000660", "pbr", 1.4, Utc::now() - Duration::hours(30))
            .await
            .unwrap();
        paper.fail_next_calls(1, || GatewayError::RateLimited);
        let stale = cache.fetch_through(&paper, "000660").await.unwrap();
        assert_eq!(stale.and_then(|r| r.pbr), Some(1.4));
    }
}
