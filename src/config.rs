//! Application configuration.
//!
//! Built once at startup: compiled-in defaults, then an optional TOML file,
//! then `STOCKBOT__SECTION__KEY` environment variables. Components receive
//! their own section by value and never read the environment again.

use std::path::Path;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Weekday};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::api::{BrokerConfig, GatewayConfig};
use crate::execution::{ExecutionConfig, ExitRules};
use crate::feed::FeedConfig;
use crate::market::MarketConfig;
use crate::persistence::StoreConfig;
use crate::risk::{FrequencyConfig, RiskConfig};
use crate::strategy::{SelectorConfig, SignalConfig};

pub const ENV_PREFIX: &str = "STOCKBOT";
pub const DEFAULT_CONFIG_PATH: &str = "config/stockbot.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential {0} (set it in the config file or environment)")]
    MissingCredential(&'static str),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Loop cadences and the trading session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Exchange-local "HH:MM"
    pub session_start: String,
    pub session_end: String,
    pub target_refresh_secs: u64,
    pub health_check_secs: u64,
    pub summary_secs: u64,
    pub housekeeping_secs: u64,
    /// Quote polling cadence while the feed is down
    pub poll_interval_secs: u64,
    pub exit_on_feed_failure: bool,
    pub exit_at_session_end: bool,
    pub trade_log_days: i64,
    /// Watched when the volume ranking is unavailable
    pub fallback_targets: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_start: "09:00".to_string(),
            session_end: "15:20".to_string(),
            target_refresh_secs: 300,
            health_check_secs: 60,
            summary_secs: 300,
            housekeeping_secs: 10,
            poll_interval_secs: 5,
            exit_on_feed_failure: false,
            exit_at_session_end: false,
            trade_log_days: 30,
            fallback_targets: ["005930", "000660", "035420", "005380", "051910"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    pub fn session(&self) -> Result<SessionWindow, ConfigError> {
        let parse = |key: &'static str, value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M")
                .map_err(|e| invalid(key, format!("{:?}: {}", value, e)))
        };
        let start = parse("orchestrator.session_start", &self.session_start)?;
        let end = parse("orchestrator.session_end", &self.session_end)?;
        if start >= end {
            return Err(invalid(
                "orchestrator.session_end",
                format!("{} is not after {}", end, start),
            ));
        }
        Ok(SessionWindow { start, end })
    }
}

/// Weekday trading window in exchange-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn is_open<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = now.time();
        self.start <= time && time < self.end
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub feed: FeedConfig,
    pub store: StoreConfig,
    pub market: MarketConfig,
    pub signal: SignalConfig,
    pub exits: ExitRules,
    pub risk: RiskConfig,
    pub frequency: FrequencyConfig,
    pub selector: SelectorConfig,
    pub execution: ExecutionConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Load `.env`, the TOML file (if any) and environment overrides.
    /// An explicit path must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Fatal problems that must stop startup. Credentials are only
    /// required for live trading.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if !dry_run {
            if self.broker.app_key.trim().is_empty() {
                return Err(ConfigError::MissingCredential("STOCKBOT__BROKER__APP_KEY"));
            }
            if self.broker.app_secret.trim().is_empty() {
                return Err(ConfigError::MissingCredential("STOCKBOT__BROKER__APP_SECRET"));
            }
            if self.broker.account_no.trim().is_empty() {
                return Err(ConfigError::MissingCredential("STOCKBOT__BROKER__ACCOUNT_NO"));
            }
        }

        let w = &self.signal.weights;
        for (key, value) in [
            ("signal.weights.rsi", w.rsi),
            ("signal.weights.macd", w.macd),
            ("signal.weights.bollinger", w.bollinger),
            ("signal.weights.volume", w.volume),
            ("signal.weights.trend", w.trend),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(invalid(key, format!("weight {} must be non-negative", value)));
            }
        }
        if w.total() <= 0.0 {
            return Err(invalid("signal.weights", "weights must not all be zero"));
        }

        for (key, value) in [
            ("store.queue_capacity", self.store.queue_capacity),
            ("store.batch_size", self.store.batch_size),
            ("execution.window_capacity", self.execution.window_capacity),
            ("feed.tick_channel_capacity", self.feed.tick_channel_capacity),
            ("execution.max_positions", self.execution.max_positions),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if !(self.exits.stop_loss_pct > 0.0 && self.exits.stop_loss_pct < 1.0) {
            return Err(invalid(
                "exits.stop_loss_pct",
                format!("{} is not a fraction in (0, 1)", self.exits.stop_loss_pct),
            ));
        }
        if self.exits.take_profit_pct <= 0.0 {
            return Err(invalid("exits.take_profit_pct", "must be positive"));
        }
        if self.risk.initial_balance <= 0.0 {
            return Err(invalid("risk.initial_balance", "must be positive"));
        }
        if self.feed.max_reconnect_attempts == 0 {
            return Err(invalid("feed.max_reconnect_attempts", "must be at least 1"));
        }

        self.orchestrator.session()?;
        Ok(())
    }
}
