// Risk management module
pub mod circuit_breakers;
pub mod frequency;
pub mod sizer;

pub use circuit_breakers::{AccountRiskState, CircuitBreakerTrip, CircuitBreakers};
pub use frequency::{FeeModel, FrequencyConfig, FrequencyController, SymbolCooldownState, Verdict};
pub use sizer::{RiskConfig, RiskSizer, TradingStats};
