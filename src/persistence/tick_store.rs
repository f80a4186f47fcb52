use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{Granularity, History, MinuteBar, Tick, TradeRecord};
use crate::Result;

/// Anything the background worker writes
#[derive(Debug, Clone, PartialEq)]
pub enum StoreItem {
    Tick(Tick),
    Bar(MinuteBar),
    Trade(TradeRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub ticks: u64,
    pub minute_bars: u64,
    pub trades: u64,
    pub financial_metrics: u64,
}

/// Durable side of the tick store
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn write_batch(&self, batch: &[StoreItem]) -> Result<()>;

    async fn load_history(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<History>;

    async fn load_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>>;

    /// Delete ticks and minute bars older than `cutoff`
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn row_counts(&self) -> Result<RowCounts>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_idle_secs: u64,
    pub retry_delay_ms: u64,
    pub healthy_queue_depth: usize,
    pub recent_write_secs: u64,
    pub failure_limit: u32, // Consecutive failed writes
    pub shutdown_timeout_secs: u64,
    pub financial_ttl_hours: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "data/stockbot.db".to_string(),
            queue_capacity: 1000,
            batch_size: 100,
            flush_idle_secs: 5,
            retry_delay_ms: 1000,
            healthy_queue_depth: 500,
            recent_write_secs: 60,
            failure_limit: 10,
            shutdown_timeout_secs: 5,
            financial_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    pub worker_alive: bool,
    pub queue_depth_ok: bool,
    pub recent_write_ok: bool,
    pub low_failure_rate: bool,
}

impl StoreHealth {
    pub fn is_healthy(&self) -> bool {
        self.worker_alive && self.queue_depth_ok && self.recent_write_ok && self.low_failure_rate
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub queue_depth: usize,
    pub saved: u64,
    pub dropped: u64,
    pub failed_writes: u64,
    pub rows: RowCounts,
}

struct Shared {
    queue: Mutex<VecDeque<StoreItem>>,
    notify: Notify,
    capacity: usize,
    batch_size: usize,
    shutting_down: AtomicBool,
    saved: AtomicU64,
    dropped: AtomicU64,
    failed_writes: AtomicU64,
    consecutive_failures: AtomicU32,
    last_progress: Mutex<Instant>,
}

impl Shared {
    fn take_batch(&self) -> Vec<StoreItem> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(self.batch_size);
        queue.drain(..n).collect()
    }
}

/// Bounded write-behind queue in front of a [`StoreBackend`].
///
/// Producers never block: on overflow the oldest queued tick is evicted
/// (trade records and bars are only evicted when no tick is left to drop).
/// A single worker task drains the queue in batches, so the backend never
/// sees concurrent writers. A failed batch is kept and retried.
pub struct PersistentTickStore {
    shared: Arc<Shared>,
    backend: Arc<dyn StoreBackend>,
    config: StoreConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentTickStore {
    /// Create the store and spawn its worker. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn StoreBackend>, config: StoreConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            notify: Notify::new(),
            capacity: config.queue_capacity.max(1),
            batch_size: config.batch_size.max(1),
            shutting_down: AtomicBool::new(false),
            saved: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_progress: Mutex::new(Instant::now()),
        });

        let store = Self {
            shared,
            backend,
            config,
            worker: Mutex::new(None),
        };
        store.spawn_worker();
        store
    }

    fn spawn_worker(&self) {
        let handle = tokio::spawn(run_worker(
            self.shared.clone(),
            self.backend.clone(),
            Duration::from_secs(self.config.flush_idle_secs),
            Duration::from_millis(self.config.retry_delay_ms),
        ));
        *self.worker.lock() = Some(handle);
    }

    fn push(&self, item: StoreItem) {
        let mut queue = self.shared.queue.lock();

        if queue.len() >= self.shared.capacity {
            let victim = queue
                .iter()
                .position(|i| matches!(i, StoreItem::Tick(_)))
                .unwrap_or(0);
            queue.remove(victim);
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                tracing::warn!("Tick queue full, dropped {} items so far", dropped);
            }
        }

        queue.push_back(item);
        let full_batch = queue.len() >= self.shared.batch_size;
        drop(queue);

        if full_batch {
            self.shared.notify.notify_one();
        }
    }

    /// Queue a tick for persistence. Never blocks.
    pub fn enqueue_tick(&self, tick: Tick) {
        self.push(StoreItem::Tick(tick));
    }

    /// Queue an upsert of a finished minute bar
    pub fn finalize_minute(&self, bar: MinuteBar) {
        self.push(StoreItem::Bar(bar));
    }

    /// Queue a trade log entry
    pub fn record_trade(&self, trade: TradeRecord) {
        self.push(StoreItem::Trade(trade));
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Earliest queued tick timestamp
    pub fn oldest_queued_tick(&self) -> Option<DateTime<Utc>> {
        self.shared.queue.lock().iter().find_map(|item| match item {
            StoreItem::Tick(t) => Some(t.timestamp),
            _ => None,
        })
    }

    pub async fn load_history(
        &self,
        symbol: &str,
        lookback_days: i64,
        granularity: Granularity,
    ) -> Result<History> {
        let since = Utc::now() - chrono::Duration::days(lookback_days);
        self.backend.load_history(symbol, since, granularity).await
    }

    pub async fn load_recent_trades(&self, days: i64) -> Result<Vec<TradeRecord>> {
        let since = Utc::now() - chrono::Duration::days(days);
        self.backend.load_trades_since(since).await
    }

    pub async fn cleanup_old(&self, keep_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);
        self.backend.cleanup_before(cutoff).await
    }

    pub fn health(&self) -> StoreHealth {
        let worker_alive = self
            .worker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        let depth = self.queue_len();
        let idle = depth == 0;
        let since_progress = self.shared.last_progress.lock().elapsed();

        StoreHealth {
            worker_alive,
            queue_depth_ok: depth < self.config.healthy_queue_depth,
            recent_write_ok: idle
                || since_progress < Duration::from_secs(self.config.recent_write_secs),
            low_failure_rate: self.shared.consecutive_failures.load(Ordering::Relaxed)
                < self.config.failure_limit,
        }
    }

    /// Replace a dead or wedged worker. Queued items are kept.
    pub fn recover(&self) {
        if let Some(old) = self.worker.lock().take() {
            old.abort();
        }
        self.shared.shutting_down.store(false, Ordering::SeqCst);
        self.shared.consecutive_failures.store(0, Ordering::Relaxed);
        *self.shared.last_progress.lock() = Instant::now();
        self.spawn_worker();
        tracing::warn!("♻️  Tick store worker restarted ({} items queued)", self.queue_len());
    }

    pub async fn stats(&self) -> StoreStats {
        let rows = match self.backend.row_counts().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to count stored rows: {}", e);
                RowCounts::default()
            }
        };
        StoreStats {
            queue_depth: self.queue_len(),
            saved: self.shared.saved.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            failed_writes: self.shared.failed_writes.load(Ordering::Relaxed),
            rows,
        }
    }

    /// Drain what is queued, waiting at most the configured timeout
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();

        let Some(mut handle) = self.worker.lock().take() else {
            return;
        };
        let limit = Duration::from_secs(self.config.shutdown_timeout_secs);

        match tokio::time::timeout(limit, &mut handle).await {
            Ok(_) => tracing::info!("Tick store drained and stopped"),
            Err(_) => {
                handle.abort();
                tracing::warn!(
                    "Tick store shutdown timed out after {:?}, {} items left unsaved",
                    limit,
                    self.queue_len()
                );
            }
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    backend: Arc<dyn StoreBackend>,
    idle_flush: Duration,
    retry_delay: Duration,
) {
    let mut pending: Vec<StoreItem> = Vec::new();

    loop {
        let stopping = shared.shutting_down.load(Ordering::SeqCst);

        if pending.is_empty() {
            let have_full_batch = shared.queue.lock().len() >= shared.batch_size;
            if !have_full_batch && !stopping {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(idle_flush) => {}
                }
            }
            pending = shared.take_batch();
        }

        if pending.is_empty() {
            if shared.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            continue;
        }

        match backend.write_batch(&pending).await {
            Ok(()) => {
                shared.saved.fetch_add(pending.len() as u64, Ordering::Relaxed);
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                *shared.last_progress.lock() = Instant::now();
                tracing::debug!("💾 Persisted batch of {}", pending.len());
                pending.clear();
            }
            Err(e) => {
                shared.failed_writes.fetch_add(1, Ordering::Relaxed);
                let failures = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Batch write of {} items failed ({} in a row): {}",
                    pending.len(),
                    failures,
                    e
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// In-memory backend with a switchable failure mode
    #[derive(Default)]
    struct MemoryBackend {
        items: Mutex<Vec<StoreItem>>,
        failing: AtomicBool,
        write_delay_ms: u64,
    }

    #[async_trait]
    impl StoreBackend for MemoryBackend {
        async fn write_batch(&self, batch: &[StoreItem]) -> Result<()> {
            if self.write_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.write_delay_ms)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err("disk unavailable".into());
            }
            self.items.lock().extend_from_slice(batch);
            Ok(())
        }

        async fn load_history(
            &self,
            symbol: &str,
            since: DateTime<Utc>,
            _granularity: Granularity,
        ) -> Result<History> {
            let ticks = self
                .items
                .lock()
                .iter()
                .filter_map(|i| match i {
                    StoreItem::Tick(t) if t.symbol == symbol && t.timestamp >= since => {
                        Some(t.clone())
                    }
                    _ => None,
                })
                .collect();
            Ok(History::Ticks(ticks))
        }

        async fn load_trades_since(&self, _since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
            Ok(Vec::new())
        }

        async fn cleanup_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn row_counts(&self) -> Result<RowCounts> {
            Ok(RowCounts {
                ticks: self.items.lock().len() as u64,
                ..Default::default()
            })
        }
    }

    fn tick(i: i64) -> Tick {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        Tick::new("005930", 70_000.0, 1, base + chrono::Duration::milliseconds(i))
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_without_blocking() {
        let backend = Arc::new(MemoryBackend {
            write_delay_ms: 50,
            ..Default::default()
        });
        let store = PersistentTickStore::start(backend, StoreConfig::default());

        let started = std::time::Instant::now();
        for i in 0..1500 {
            store.enqueue_tick(tick(i));
            assert!(store.queue_len() <= 1000);
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        // The worker never ran in between: exactly the first 500 were evicted
        assert_eq!(store.queue_len(), 1000);
        assert_eq!(store.oldest_queued_tick(), Some(tick(500).timestamp));
        assert_eq!(store.stats().await.dropped, 500);
    }

    #[tokio::test]
    async fn test_trade_records_survive_overflow() {
        let backend = Arc::new(MemoryBackend::default());
        let config = StoreConfig {
            queue_capacity: 3,
            batch_size: 100,
            ..Default::default()
        };
        let store = PersistentTickStore::start(backend, config);

        let trade = TradeRecord::buy("005930", 70_000.0, 1, Utc::now(), "signal");
        store.record_trade(trade);
        for i in 0..5 {
            store.enqueue_tick(tick(i));
        }

        let queue = store.shared.queue.lock();
        assert_eq!(queue.len(), 3);
        assert!(matches!(queue[0], StoreItem::Trade(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_writes_partial_batch() {
        let backend = Arc::new(MemoryBackend::default());
        let store = PersistentTickStore::start(backend.clone(), StoreConfig::default());

        for i in 0..10 {
            store.enqueue_tick(tick(i));
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(backend.items.lock().len(), 10);
        assert_eq!(store.queue_len(), 0);
        assert!(store.health().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_retried() {
        let backend = Arc::new(MemoryBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let config = StoreConfig {
            failure_limit: 3,
            ..Default::default()
        };
        let store = PersistentTickStore::start(backend.clone(), config);

        for i in 0..100 {
            store.enqueue_tick(tick(i));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = store.stats().await;
        assert!(stats.failed_writes >= 3);
        assert!(!store.health().low_failure_rate);
        assert!(backend.items.lock().is_empty());

        backend.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(backend.items.lock().len(), 100);
        assert!(store.health().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue() {
        let backend = Arc::new(MemoryBackend::default());
        let store = PersistentTickStore::start(backend.clone(), StoreConfig::default());

        for i in 0..250 {
            store.enqueue_tick(tick(i));
        }
        store.shutdown().await;

        assert_eq!(backend.items.lock().len(), 250);
        assert!(!store.health().worker_alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded_when_backend_is_down() {
        let backend = Arc::new(MemoryBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let store = PersistentTickStore::start(backend, StoreConfig::default());
        store.enqueue_tick(tick(0));

        let started = Instant::now();
        store.shutdown().await;
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert!(!store.health().worker_alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_respawns_worker() {
        let backend = Arc::new(MemoryBackend::default());
        let store = PersistentTickStore::start(backend.clone(), StoreConfig::default());
        store.shutdown().await;
        assert!(!store.health().worker_alive);

        store.recover();
        store.enqueue_tick(tick(1));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.health().worker_alive);
        assert_eq!(backend.items.lock().len(), 1);
    }
}
