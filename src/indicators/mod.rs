// Technical indicators module
// Stateless functions: RSI, EMA/SMA, MACD, Bollinger Bands, support/resistance, volatility

pub mod bollinger;
pub mod levels;
pub mod macd;
pub mod moving_average;
pub mod rsi;
pub mod volatility;

pub use bollinger::{calculate_bollinger, BollingerBands};
pub use levels::support_resistance;
pub use macd::{calculate_macd, Macd};
pub use moving_average::{calculate_ema, calculate_sma, ema_series};
pub use rsi::calculate_rsi;
pub use volatility::{
    annualized_volatility, coefficient_of_variation, population_std_dev, volatility_ratio,
};
