use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::api::{BrokerClient, GatewayResult};
use crate::models::Tick;

/// Quote polling used while the realtime feed is down.
///
/// Quotes report cumulative session volume; each synthetic tick carries the
/// volume traded since the previous poll of that symbol.
pub struct PriceFeedManager {
    broker: Arc<dyn BrokerClient>,
    last_volume: HashMap<String, u64>,
}

impl PriceFeedManager {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            last_volume: HashMap::new(),
        }
    }

    /// Fetch one quote and turn it into a tick
    pub async fn fetch_tick(&mut self, symbol: &str) -> GatewayResult<Tick> {
        let quote = self.broker.get_current_price(symbol).await?;

        let volume = match self.last_volume.insert(symbol.to_string(), quote.volume) {
            Some(prev) if quote.volume >= prev => quote.volume - prev,
            Some(_) => quote.volume, // Counter reset: new session
            None => 0,
        };

        tracing::debug!(
            symbol = %symbol,
            price = %quote.price,
            volume,
            "Polled quote"
        );

        Ok(Tick::new(symbol, quote.price, volume, Utc::now()))
    }

    /// Poll every symbol; failures are logged and skipped
    pub async fn fetch_all(&mut self, symbols: &[String]) -> Vec<Tick> {
        let mut ticks = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.fetch_tick(symbol).await {
                Ok(tick) if tick.price > 0.0 => ticks.push(tick),
                Ok(_) => tracing::warn!("Ignoring zero price quote for {}", symbol),
                Err(e) => tracing::warn!("Quote poll failed for {}: {}", symbol, e),
            }
        }
        self.last_volume.retain(|s, _| symbols.contains(s));
        ticks
    }
}
