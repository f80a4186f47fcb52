pub mod broker;
pub mod error;
pub mod gateway;
pub mod kis;
pub mod paper;

pub use broker::BrokerClient;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{CacheStats, GatewayConfig, RateLimitedGateway, ResponseCache};
pub use kis::{BrokerConfig, KisClient};
pub use paper::{PaperBroker, PaperFill};
