//! Inbound-traffic clock for the realtime connection.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks when anything last arrived and when we last pinged.
pub struct Heartbeat {
    interval: Duration,
    silence_limit: Duration,
    last_message: RwLock<Instant>,
    last_ping: RwLock<Option<Instant>>,
}

impl Heartbeat {
    pub fn new(interval: Duration, silence_limit: Duration) -> Self {
        Self {
            interval,
            silence_limit,
            last_message: RwLock::new(Instant::now()),
            last_ping: RwLock::new(None),
        }
    }

    /// Called on every (re)connect
    pub fn reset(&self) {
        *self.last_message.write() = Instant::now();
        *self.last_ping.write() = None;
    }

    pub fn record_message(&self) {
        *self.last_message.write() = Instant::now();
    }

    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Instant::now());
    }

    pub fn silence(&self) -> Duration {
        self.last_message.read().elapsed()
    }

    /// Quiet for a full interval and no ping sent since the last message
    pub fn should_ping(&self) -> bool {
        let last_message = *self.last_message.read();
        let pinged_since = self
            .last_ping
            .read()
            .is_some_and(|p| p >= last_message && p.elapsed() < self.interval);
        last_message.elapsed() >= self.interval && !pinged_since
    }

    /// Quiet beyond the hard limit: the connection is presumed dead
    pub fn is_dead(&self) -> bool {
        self.silence() > self.silence_limit
    }

    pub fn check_period(&self) -> Duration {
        (self.interval / 2).max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_dead() {
        let hb = Heartbeat::new(Duration::from_secs(30), Duration::from_secs(90));
        assert!(!hb.should_ping());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(hb.should_ping());
        hb.record_ping();
        assert!(!hb.should_ping());
        assert!(!hb.is_dead());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(hb.is_dead());

        hb.record_message();
        assert!(!hb.is_dead());
        assert!(!hb.should_ping());
    }
}
