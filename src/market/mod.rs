// Broad-market pre-trade veto
pub mod condition;

pub use condition::{classify, MarketAssessment, MarketConditionGate, MarketConfig};
