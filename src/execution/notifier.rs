use async_trait::async_trait;
use std::fmt;

/// Human-readable events for an external messaging channel
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Started(String),
    Stopped(String),
    PositionOpened {
        symbol: String,
        quantity: u64,
        price: f64,
        reason: String,
    },
    PositionClosed {
        symbol: String,
        quantity: u64,
        price: f64,
        reason: String,
        pnl: f64,
        pnl_pct: f64,
        /// Fee-aware view of the sell, e.g. "profitable sell (net +3452)"
        assessment: String,
    },
    Error(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Started(msg) => write!(f, "🚀 Started: {}", msg),
            Notification::Stopped(msg) => write!(f, "👋 Stopped: {}", msg),
            Notification::PositionOpened {
                symbol,
                quantity,
                price,
                reason,
            } => write!(f, "📥 Bought {} x{} @ {:.0} ({})", symbol, quantity, price, reason),
            Notification::PositionClosed {
                symbol,
                quantity,
                price,
                reason,
                pnl,
                pnl_pct,
                assessment,
            } => write!(
                f,
                "📤 Sold {} x{} @ {:.0} ({}): {:+.0} ({:+.2}%), {}",
                symbol, quantity, price, reason, pnl, pnl_pct, assessment
            ),
            Notification::Error(msg) => write!(f, "❌ Error: {}", msg),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Notification) -> anyhow::Result<()> {
        match event {
            Notification::Error(_) => tracing::error!("{}", event),
            _ => tracing::info!("{}", event),
        }
        Ok(())
    }
}

/// Delivery failures are logged and otherwise ignored
pub async fn notify_best_effort(notifier: &dyn Notifier, event: Notification) {
    if let Err(e) = notifier.notify(&event).await {
        tracing::warn!("Notification dropped ({}): {}", e, event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records events; optionally fails every delivery
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub events: Mutex<Vec<Notification>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &Notification) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("channel down");
            }
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        notify_best_effort(&notifier, Notification::Started("test".into())).await;
        assert!(notifier.events.lock().is_empty());
    }

    #[test]
    fn test_close_message() {
        let event = Notification::PositionClosed {
            symbol: "005930".into(),
            quantity: 7,
            price: 9_790.0,
            reason: "stop_loss".into(),
            pnl: -1_470.0,
            pnl_pct: -2.1,
            assessment: "protective sell (-2.10%)".into(),
        };
        assert_eq!(
            event.to_string(),
            "📤 Sold 005930 x7 @ 9790 (stop_loss): -1470 (-2.10%), protective sell (-2.10%)"
        );
    }
}
