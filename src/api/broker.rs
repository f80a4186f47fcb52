use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::GatewayResult;
use crate::models::{
    Balance, DailyBar, FinancialRatios, IndexSnapshot, OrderAck, OrderPrice, OrderSide, Quote,
    RankedStock,
};

/// Broker operations the engine depends on.
///
/// Every call either returns a typed payload or an error; an empty success
/// is never used to signal failure.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_current_price(&self, symbol: &str) -> GatewayResult<Quote>;

    /// Daily OHLCV between `start` and `end` inclusive, oldest first
    async fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> GatewayResult<Vec<DailyBar>>;

    async fn get_balance(&self) -> GatewayResult<Balance>;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: OrderPrice,
    ) -> GatewayResult<OrderAck>;

    async fn get_index(&self, code: &str) -> GatewayResult<IndexSnapshot>;

    async fn get_volume_ranking(&self) -> GatewayResult<Vec<RankedStock>>;

    async fn get_financial_ratios(&self, symbol: &str) -> GatewayResult<FinancialRatios>;

    /// Session key for the realtime stream
    async fn stream_approval_key(&self) -> GatewayResult<String>;
}
