// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod market;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
