// Trading engine: rolling state, position lifecycle and order execution
pub mod executor;
pub mod notifier;
pub mod position_manager;
pub mod price_feed;
pub mod rolling_store;

pub use executor::{
    EngineCommand, ExecutionAction, ExecutionConfig, ExecutionDecision, Executor, PositionSummary,
    PositionView,
};
pub use notifier::{notify_best_effort, LogNotifier, Notification, Notifier};
pub use position_manager::{ExitReason, ExitRules, Position, PositionManager, PositionStatus};
pub use price_feed::PriceFeedManager;
pub use rolling_store::{RollingSeriesStore, RollingWindow, SeriesField};
