// Core modules
pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod market;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod simulation;
pub mod strategy;

// Re-export commonly used types
pub use config::StrategySettings;
pub use error::{Result, StrategyError};
pub use models::*;
pub use strategy::UmbrellaStrategy;
