// Signal scoring and target selection
pub mod selector;
pub mod signals;

pub use selector::{SelectorConfig, TargetSelector};
pub use signals::{BuyDecision, BuyScore, SellScore, SignalConfig, SignalScorer};
