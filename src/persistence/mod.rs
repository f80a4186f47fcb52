// Write-behind tick persistence, minute-bar aggregation and cached fundamentals
pub mod aggregator;
pub mod financial_cache;
pub mod tick_store;

pub use aggregator::MinuteAggregator;
pub use financial_cache::FinancialMetricCache;
pub use tick_store::{
    PersistentTickStore, RowCounts, StoreBackend, StoreConfig, StoreHealth, StoreItem, StoreStats,
};
