//! Realtime connection supervisor.
//!
//! Owns the WebSocket session: connects, (re)subscribes the externally
//! chosen symbol set, decodes frames and forwards trade ticks over a
//! channel. Failed sessions are retried with capped exponential backoff up
//! to a bounded attempt count, after which the supervisor reports `Failed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{FeedError, FeedResult};
use super::frame::{subscription_request, Frame, FrameContext};
use super::heartbeat::Heartbeat;
use crate::models::Tick;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Overrides the broker's realtime endpoint when set
    pub url: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub silence_limit_secs: u64,
    /// Exchange local time offset used to date HHMMSS trade stamps
    pub utc_offset_hours: i32,
    pub subscribe_spacing_ms: u64,
    /// Per-session subscription cap imposed by the broker
    pub max_subscriptions: usize,
    pub tick_channel_capacity: usize,
    /// Orchestrator wait before restarting a failed supervisor
    pub restart_cooldown_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 60_000,
            heartbeat_interval_secs: 30,
            silence_limit_secs: 90,
            utc_offset_hours: 9,
            subscribe_spacing_ms: 50,
            max_subscriptions: 40,
            tick_channel_capacity: 10_000,
            restart_cooldown_secs: 60,
        }
    }
}

impl FeedConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    /// base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.reconnect_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.reconnect_max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Replace the subscribed symbol set
    Subscribe(Vec<String>),
}

/// Cloneable control surface for a running supervisor
#[derive(Clone)]
pub struct FeedHandle {
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::Sender<FeedCommand>,
    shutdown: CancellationToken,
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl FeedHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns false if the supervisor is gone
    pub async fn set_targets(&self, symbols: Vec<String>) -> bool {
        self.commands
            .send(FeedCommand::Subscribe(symbols))
            .await
            .is_ok()
    }

    pub fn shutdown(&self) {
        info!("Feed shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Backoff delays applied so far, in order
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

pub struct ConnectionSupervisor {
    config: FeedConfig,
    url: String,
    approval_key: String,
    targets: Vec<String>,
    state: Arc<RwLock<ConnectionState>>,
    heartbeat: Heartbeat,
    commands: mpsc::Receiver<FeedCommand>,
    tick_tx: mpsc::Sender<Tick>,
    shutdown: CancellationToken,
    delays: Arc<Mutex<Vec<Duration>>>,
    last_delivered: HashMap<String, (DateTime<Utc>, f64, u64)>,
    established: bool,
}

impl ConnectionSupervisor {
    pub fn new(
        config: FeedConfig,
        url: impl Into<String>,
        approval_key: impl Into<String>,
        targets: Vec<String>,
        tick_tx: mpsc::Sender<Tick>,
    ) -> (Self, FeedHandle) {
        let (command_tx, commands) = mpsc::channel(16);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let shutdown = CancellationToken::new();
        let delays = Arc::new(Mutex::new(Vec::new()));
        let heartbeat = Heartbeat::new(
            Duration::from_secs(config.heartbeat_interval_secs),
            Duration::from_secs(config.silence_limit_secs),
        );

        let handle = FeedHandle {
            state: state.clone(),
            commands: command_tx,
            shutdown: shutdown.clone(),
            delays: delays.clone(),
        };

        let supervisor = Self {
            config,
            url: url.into(),
            approval_key: approval_key.into(),
            targets,
            state,
            heartbeat,
            commands,
            tick_tx,
            shutdown,
            delays,
            last_delivered: HashMap::new(),
            established: false,
        };

        (supervisor, handle)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Run until shutdown (Ok) or until reconnection attempts are exhausted
    pub async fn run(mut self) -> FeedResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            self.established = false;

            match self.try_connect().await {
                Ok(()) => info!("Feed session ended"),
                Err(e) => warn!("Feed session error: {}", e),
            }

            if self.shutdown.is_cancelled() {
                info!("Shutdown requested, not reconnecting");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            if self.established {
                attempt = 0;
            }
            attempt += 1;

            if attempt >= self.config.max_reconnect_attempts {
                error!("Feed reconnection exhausted after {} attempts", attempt);
                self.set_state(ConnectionState::Failed);
                return Err(FeedError::Exhausted { attempts: attempt });
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.config.backoff(attempt);
            self.delays.lock().push(delay);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting feed"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    async fn try_connect(&mut self) -> FeedResult<()> {
        info!(url = %self.url, "Connecting feed");
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        self.established = true;
        self.set_state(ConnectionState::Connected);
        self.heartbeat.reset();
        info!("Feed connected");

        let mut ctx = FrameContext::new(self.config.offset());
        let mut subscribed = HashSet::new();
        self.resubscribe(&mut write, &mut subscribed).await?;

        let shutdown = self.shutdown.clone();
        let mut check = tokio::time::interval(self.heartbeat.check_period());
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    return Ok(());
                }

                Some(command) = self.commands.recv() => {
                    match command {
                        FeedCommand::Subscribe(symbols) => {
                            self.targets = symbols;
                            self.resubscribe(&mut write, &mut subscribed).await?;
                        }
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.heartbeat.record_message();
                            self.handle_text(&text, &mut ctx, &mut write).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.heartbeat.record_message();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, "normal close".to_string()));
                            return Err(FeedError::Closed { code, reason });
                        }
                        Some(Ok(_)) => self.heartbeat.record_message(),
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(FeedError::Closed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            })
                        }
                    }
                }

                _ = check.tick() => {
                    if self.heartbeat.is_dead() {
                        return Err(FeedError::HeartbeatTimeout(self.heartbeat.silence().as_secs()));
                    }
                    if self.heartbeat.should_ping() {
                        write.send(Message::Ping(Vec::new())).await?;
                        self.heartbeat.record_ping();
                        debug!("Feed keepalive sent");
                    }
                }
            }
        }
    }

    async fn handle_text(
        &mut self,
        text: &str,
        ctx: &mut FrameContext,
        write: &mut WsSink,
    ) -> FeedResult<()> {
        match ctx.parse(text) {
            Ok(Frame::PingPong) => {
                write.send(Message::Text(text.to_string())).await?;
            }
            Ok(Frame::SubscribeAck {
                tr_key,
                message,
                cipher,
            }) => {
                debug!("Subscription ack {}: {}", tr_key, message);
                if cipher.is_some() {
                    ctx.cipher = cipher;
                }
            }
            Ok(Frame::Trades(ticks)) => {
                for tick in ticks {
                    if !self.accept(&tick) {
                        debug!("Replayed tick for {} at {} dropped", tick.symbol, tick.timestamp);
                        continue;
                    }
                    if self.tick_tx.send(tick).await.is_err() {
                        warn!("Tick receiver dropped, stopping feed");
                        self.shutdown.cancel();
                        return Ok(());
                    }
                }
            }
            Ok(Frame::Other(desc)) => debug!("Ignored frame: {}", desc),
            Err(e) => warn!("Dropping frame: {}", e),
        }
        Ok(())
    }

    /// True when the tick is not a replay of what was already delivered
    fn accept(&mut self, tick: &Tick) -> bool {
        let key = (tick.timestamp, tick.price, tick.volume);
        match self.last_delivered.get(&tick.symbol) {
            Some(last) if tick.timestamp < last.0 || key == *last => false,
            _ => {
                self.last_delivered.insert(tick.symbol.clone(), key);
                true
            }
        }
    }

    async fn resubscribe(
        &mut self,
        write: &mut WsSink,
        subscribed: &mut HashSet<String>,
    ) -> FeedResult<()> {
        let mut desired: Vec<String> = Vec::new();
        for symbol in &self.targets {
            if !desired.contains(symbol) {
                desired.push(symbol.clone());
            }
        }
        if desired.len() > self.config.max_subscriptions {
            warn!(
                "{} targets exceed the subscription cap, keeping {}",
                desired.len(),
                self.config.max_subscriptions
            );
            desired.truncate(self.config.max_subscriptions);
        }
        let desired_set: HashSet<String> = desired.iter().cloned().collect();

        let removed: Vec<String> = subscribed.difference(&desired_set).cloned().collect();
        for symbol in &removed {
            self.send_request(write, symbol, false).await?;
            subscribed.remove(symbol);
        }
        let added: Vec<String> = desired
            .into_iter()
            .filter(|s| !subscribed.contains(s))
            .collect();
        for symbol in &added {
            self.send_request(write, symbol, true).await?;
            subscribed.insert(symbol.clone());
        }

        self.last_delivered.retain(|s, _| desired_set.contains(s));
        info!(
            "Feed subscriptions: {} (+{} -{})",
            subscribed.len(),
            added.len(),
            removed.len()
        );
        Ok(())
    }

    async fn send_request(&self, write: &mut WsSink, symbol: &str, subscribe: bool) -> FeedResult<()> {
        let request = subscription_request(&self.approval_key, symbol, subscribe);
        write.send(Message::Text(request)).await?;
        if self.config.subscribe_spacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.subscribe_spacing_ms)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn supervisor() -> ConnectionSupervisor {
        let (tx, _rx) = mpsc::channel(8);
        let (sup, _handle) = ConnectionSupervisor::new(
            FeedConfig::default(),
            "ws://127.0.0.1:1",
            "key",
            vec!["005930".to_string()],
            tx,
        );
        sup
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = FeedConfig {
            reconnect_base_ms: 1000,
            reconnect_max_ms: 5000,
            ..Default::default()
        };
        let delays: Vec<u64> = (1..=5).map(|a| config.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_replayed_tick_rejected() {
        let mut sup = supervisor();
        let t = |s| Utc.with_ymd_and_hms(2024, 3, 4, 0, 15, s).unwrap();

        assert!(sup.accept(&Tick::new("005930", 71200.0, 5, t(30))));
        // Same-second trade with a different size is a new trade
        assert!(sup.accept(&Tick::new("005930", 71200.0, 7, t(30))));
        assert!(!sup.accept(&Tick::new("005930", 71200.0, 7, t(30))));
        assert!(!sup.accept(&Tick::new("005930", 71100.0, 1, t(29))));
        assert!(sup.accept(&Tick::new("005930", 71300.0, 1, t(31))));
        assert!(sup.accept(&Tick::new("000660", 180000.0, 1, t(0))));
    }

    #[test]
    fn test_offset_defaults_to_kst() {
        assert_eq!(FeedConfig::default().offset().local_minus_utc(), 9 * 3600);
    }
}
