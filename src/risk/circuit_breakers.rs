use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Account-level circuit breakers to prevent catastrophic losses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub min_balance_ratio: f64,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.05,  // -5% of initial balance per day
            max_consecutive_losses: 3, // 3 losing sells in a row
            min_balance_ratio: 0.5,    // Stop below 50% of initial balance
        }
    }
}

/// Process-wide account state with a daily lifecycle
#[derive(Debug, Clone)]
pub struct AccountRiskState {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub daily_realized_pnl: f64,
    pub consecutive_losses: u32,
    pub today_trade_count: u32,
    pub last_reset_date: NaiveDate,
}

impl AccountRiskState {
    pub fn new(initial_balance: f64, today: NaiveDate) -> Self {
        Self {
            initial_balance,
            current_balance: initial_balance,
            daily_realized_pnl: 0.0,
            consecutive_losses: 0,
            today_trade_count: 0,
            last_reset_date: today,
        }
    }

    pub fn balance_floor(&self, min_balance_ratio: f64) -> f64 {
        self.initial_balance * min_balance_ratio
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyLoss { pnl: f64, limit: f64 },
    ConsecutiveLosses { count: u32, limit: u32 },
    BalanceFloor { balance: f64, floor: f64 },
}

impl fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerTrip::DailyLoss { pnl, limit } => {
                write!(f, "daily loss limit reached ({:.0} <= {:.0})", pnl, limit)
            }
            CircuitBreakerTrip::ConsecutiveLosses { count, limit } => {
                write!(f, "consecutive losses {} >= {}", count, limit)
            }
            CircuitBreakerTrip::BalanceFloor { balance, floor } => {
                write!(f, "balance {:.0} at or below floor {:.0}", balance, floor)
            }
        }
    }
}

impl CircuitBreakers {
    pub fn check(&self, state: &AccountRiskState) -> Result<(), CircuitBreakerTrip> {
        // Daily loss is measured against the initial balance
        let limit = -self.max_daily_loss_pct * state.initial_balance;
        if state.daily_realized_pnl <= limit {
            return Err(CircuitBreakerTrip::DailyLoss {
                pnl: state.daily_realized_pnl,
                limit,
            });
        }

        if state.consecutive_losses >= self.max_consecutive_losses {
            return Err(CircuitBreakerTrip::ConsecutiveLosses {
                count: state.consecutive_losses,
                limit: self.max_consecutive_losses,
            });
        }

        let floor = state.balance_floor(self.min_balance_ratio);
        if state.current_balance <= floor {
            return Err(CircuitBreakerTrip::BalanceFloor {
                balance: state.current_balance,
                floor,
            });
        }

        Ok(())
    }
}
