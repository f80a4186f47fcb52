use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::broker::BrokerClient;
use super::error::{GatewayError, GatewayResult};
use crate::models::{
    Balance, DailyBar, FinancialRatios, Holding, IndexSnapshot, OrderAck, OrderPrice, OrderSide,
    Quote, RankedStock,
};

type FailureFactory = Box<dyn Fn() -> GatewayError + Send + Sync>;

/// A simulated fill, kept for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: f64,
}

#[derive(Default)]
struct PaperState {
    cash: f64,
    holdings: HashMap<String, Holding>,
    quotes: HashMap<String, Quote>,
    indices: HashMap<String, IndexSnapshot>,
    daily: HashMap<String, Vec<DailyBar>>,
    ranking: Vec<RankedStock>,
    ratios: HashMap<String, FinancialRatios>,
    fills: Vec<PaperFill>,
    pending_failures: u32,
    failure: Option<FailureFactory>,
    pending_order_failures: u32,
}

/// Paper-trading broker.
///
/// Orders are simulated against an in-memory cash/holdings book. Market data
/// comes from an optional upstream client (dry-run against live quotes) or
/// from values set directly.
pub struct PaperBroker {
    upstream: Option<Arc<dyn BrokerClient>>,
    state: Mutex<PaperState>,
    calls: AtomicU64,
    next_order: AtomicU64,
}

impl PaperBroker {
    pub fn new(cash: f64) -> Self {
        Self {
            upstream: None,
            state: Mutex::new(PaperState {
                cash,
                ..Default::default()
            }),
            calls: AtomicU64::new(0),
            next_order: AtomicU64::new(1),
        }
    }

    /// Simulate orders but read market data from `upstream`
    pub fn with_upstream(cash: f64, upstream: Arc<dyn BrokerClient>) -> Self {
        Self {
            upstream: Some(upstream),
            ..Self::new(cash)
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.set_quote(Quote {
            symbol: symbol.to_string(),
            price,
            change_pct: 0.0,
            volume: 0,
            high: price,
            low: price,
        });
    }

    pub fn set_quote(&self, quote: Quote) {
        self.state.lock().quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn set_index(&self, code: &str, value: f64, change_pct: f64) {
        self.state.lock().indices.insert(
            code.to_string(),
            IndexSnapshot {
                code: code.to_string(),
                value,
                change_pct,
            },
        );
    }

    pub fn set_daily_history(&self, symbol: &str, bars: Vec<DailyBar>) {
        self.state.lock().daily.insert(symbol.to_string(), bars);
    }

    pub fn set_ranking(&self, ranking: Vec<RankedStock>) {
        self.state.lock().ranking = ranking;
    }

    pub fn set_ratios(&self, symbol: &str, ratios: FinancialRatios) {
        self.state.lock().ratios.insert(symbol.to_string(), ratios);
    }

    pub fn set_holding(&self, symbol: &str, quantity: u64, avg_price: f64) {
        self.state.lock().holdings.insert(
            symbol.to_string(),
            Holding {
                symbol: symbol.to_string(),
                quantity,
                avg_price,
            },
        );
    }

    /// Fail the next `n` calls of any kind with the error `make` builds
    pub fn fail_next_calls<F>(&self, n: u32, make: F)
    where
        F: Fn() -> GatewayError + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.pending_failures = n;
        state.failure = Some(Box::new(make));
    }

    /// Reject the next `n` orders
    pub fn fail_next_orders(&self, n: u32) {
        self.state.lock().pending_order_failures = n;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.state.lock().fills.clone()
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().cash
    }

    fn enter(&self) -> GatewayResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            if let Some(make) = &state.failure {
                return Err(make());
            }
        }
        Ok(())
    }

    fn local_quote(&self, symbol: &str) -> GatewayResult<Quote> {
        self.state
            .lock()
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "NO_QUOTE".into(),
                message: format!("no quote for {}", symbol),
            })
    }

    fn fill(&self, symbol: &str, side: OrderSide, quantity: u64, price: f64) -> GatewayResult<OrderAck> {
        let mut state = self.state.lock();
        if state.pending_order_failures > 0 {
            state.pending_order_failures -= 1;
            return Err(GatewayError::Rejected {
                code: "PAPER_REJECT".into(),
                message: "simulated order rejection".into(),
            });
        }

        let notional = price * quantity as f64;
        match side {
            OrderSide::Buy => {
                if notional > state.cash {
                    return Err(GatewayError::Rejected {
                        code: "INSUFFICIENT_CASH".into(),
                        message: format!("need {:.0}, have {:.0}", notional, state.cash),
                    });
                }
                state.cash -= notional;
                let holding = state
                    .holdings
                    .entry(symbol.to_string())
                    .or_insert_with(|| Holding {
                        symbol: symbol.to_string(),
                        quantity: 0,
                        avg_price: 0.0,
                    });
                let total_cost = holding.avg_price * holding.quantity as f64 + notional;
                holding.quantity += quantity;
                holding.avg_price = total_cost / holding.quantity as f64;
            }
            OrderSide::Sell => {
                let held = state.holdings.get(symbol).map(|h| h.quantity).unwrap_or(0);
                if held < quantity {
                    return Err(GatewayError::Rejected {
                        code: "INSUFFICIENT_HOLDING".into(),
                        message: format!("hold {} of {}, selling {}", held, symbol, quantity),
                    });
                }
                state.cash += notional;
                if held == quantity {
                    state.holdings.remove(symbol);
                } else if let Some(h) = state.holdings.get_mut(symbol) {
                    h.quantity -= quantity;
                }
            }
        }

        let order_id = format!("PAPER-{:06}", self.next_order.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            "📝 Paper {:?} {} x{} @ {:.0} ({})",
            side,
            symbol,
            quantity,
            price,
            order_id
        );
        state.fills.push(PaperFill {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
        });
        Ok(OrderAck {
            order_id: Some(order_id),
            fill_price: Some(price),
        })
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_current_price(&self, symbol: &str) -> GatewayResult<Quote> {
        self.enter()?;
        match &self.upstream {
            Some(upstream) => {
                let quote = upstream.get_current_price(symbol).await?;
                self.set_quote(quote.clone());
                Ok(quote)
            }
            None => self.local_quote(symbol),
        }
    }

    async fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> GatewayResult<Vec<DailyBar>> {
        self.enter()?;
        if let Some(upstream) = &self.upstream {
            return upstream.get_daily_history(symbol, start, end).await;
        }
        let state = self.state.lock();
        Ok(state
            .daily
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_balance(&self) -> GatewayResult<Balance> {
        self.enter()?;
        let state = self.state.lock();
        let mut holdings: Vec<Holding> = state.holdings.values().cloned().collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(Balance {
            cash_available: state.cash,
            holdings,
        })
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: OrderPrice,
    ) -> GatewayResult<OrderAck> {
        self.enter()?;
        if quantity == 0 {
            return Err(GatewayError::Rejected {
                code: "ZERO_QTY".into(),
                message: "quantity must be positive".into(),
            });
        }

        let fill_price = match price {
            OrderPrice::Limit(p) => p,
            OrderPrice::Market => match &self.upstream {
                Some(upstream) => upstream.get_current_price(symbol).await?.price,
                None => self.local_quote(symbol)?.price,
            },
        };
        self.fill(symbol, side, quantity, fill_price)
    }

    async fn get_index(&self, code: &str) -> GatewayResult<IndexSnapshot> {
        self.enter()?;
        if let Some(upstream) = &self.upstream {
            return upstream.get_index(code).await;
        }
        self.state
            .lock()
            .indices
            .get(code)
            .cloned()
            .ok_or_else(|| GatewayError::Malformed(format!("no index {}", code)))
    }

    async fn get_volume_ranking(&self) -> GatewayResult<Vec<RankedStock>> {
        self.enter()?;
        if let Some(upstream) = &self.upstream {
            return upstream.get_volume_ranking().await;
        }
        Ok(self.state.lock().ranking.clone())
    }

    async fn get_financial_ratios(&self, symbol: &str) -> GatewayResult<FinancialRatios> {
        self.enter()?;
        if let Some(upstream) = &self.upstream {
            return upstream.get_financial_ratios(symbol).await;
        }
        Ok(self.state.lock().ratios.get(symbol).cloned().unwrap_or_default())
    }

    async fn stream_approval_key(&self) -> GatewayResult<String> {
        self.enter()?;
        match &self.upstream {
            Some(upstream) => upstream.stream_approval_key().await,
            None => Ok("paper-approval-key".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buy_then_sell_updates_book() {
        let broker = PaperBroker::new(1_000_000.0);
        broker.set_price("005930", 70_000.0);

        let ack = broker
            .place_order("005930", OrderSide::Buy, 10, OrderPrice::Market)
            .await
            .unwrap();
        assert!(ack.order_id.is_some());
        assert_eq!(broker.cash(), 300_000.0);

        broker.set_price("005930", 71_000.0);
        broker
            .place_order("005930", OrderSide::Sell, 10, OrderPrice::Market)
            .await
            .unwrap();
        assert_eq!(broker.cash(), 1_010_000.0);
        assert!(broker.get_balance().await.unwrap().holdings.is_empty());
        assert_eq!(broker.fills().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_overspend_and_oversell() {
        let broker = PaperBroker::new(100_000.0);
        broker.set_price("005930", 70_000.0);

        assert!(broker
            .place_order("005930", OrderSide::Buy, 2, OrderPrice::Market)
            .await
            .is_err());
        assert!(broker
            .place_order("005930", OrderSide::Sell, 1, OrderPrice::Market)
            .await
            .is_err());
        assert_eq!(broker.cash(), 100_000.0);
    }

    #[tokio::test]
    async fn test_injected_order_failures() {
        let broker = PaperBroker::new(1_000_000.0);
        broker.set_price("005930", 70_000.0);
        broker.fail_next_orders(1);

        assert!(broker
            .place_order("005930", OrderSide::Buy, 1, OrderPrice::Market)
            .await
            .is_err());
        assert!(broker
            .place_order("005930", OrderSide::Buy, 1, OrderPrice::Market)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_upstream_supplies_quotes() {
        let upstream = Arc::new(PaperBroker::new(0.0));
        upstream.set_price("000660", 180_000.0);
        let broker = PaperBroker::with_upstream(500_000.0, upstream.clone());

        let quote = broker.get_current_price("000660").await.unwrap();
        assert_eq!(quote.price, 180_000.0);
        broker
            .place_order("000660", OrderSide::Buy, 2, OrderPrice::Market)
            .await
            .unwrap();
        assert_eq!(broker.cash(), 140_000.0);
        // Upstream book untouched
        assert_eq!(upstream.cash(), 0.0);
    }
}
