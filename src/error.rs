use thiserror::Error;

use crate::execution::GatewayError;

/// Errors surfaced by the strategy core.
///
/// Per-tick evaluation never produces one of these; tick problems are
/// reported as [`crate::strategy::TickOutcome`] variants instead.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid time of day '{0}', expected HH:MM:SS")]
    InvalidTimeOfDay(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("scheduled start {requested} lies {delay_ms} ms in the past")]
    SchedulingAnomaly { requested: String, delay_ms: i64 },

    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("selection store error: {0}")]
    Persistence(#[from] redis::RedisError),

    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
}

impl StrategyError {
    /// True for errors caused by caller input rather than runtime conditions.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StrategyError::InvalidTimeOfDay(_)
                | StrategyError::InvalidSetting { .. }
                | StrategyError::Settings(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StrategyError>;
