//! Strategy settings.
//!
//! Loaded from an optional TOML file with `UMBRELLA_*` environment
//! overrides, e.g. `UMBRELLA_PURCHASE_PARTS=5`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StrategyError};

pub const DEFAULT_SETTINGS_FILE: &str = "umbrella.toml";
const ENV_PREFIX: &str = "UMBRELLA";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategySettings {
    /// Lower universe price bound (exclusive)
    pub price_min: f64,
    /// Upper universe price bound (exclusive)
    pub price_max: f64,
    /// Total allocated capital, in the secondary currency
    pub purchase_volume: f64,
    /// Equal parts the capital is split into; also the in-flight order cap
    pub purchase_parts: usize,
    /// Global threshold in percent
    pub change_percent: f64,
    pub take_profit_percent: f64,
    /// Pulls the limit price toward the tick extreme, 0 < f <= 1
    pub approximation_factor: f64,
    /// Prior candles that must close below the sell price, 0 disables
    pub spike_protection: usize,
    /// 0 disables the close-price guard
    pub close_price_protection_percent: f64,
    pub min_tick_volume: u64,
    pub min_day_volume: u64,
    pub reset_interval_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub order_lifetime_seconds: u64,
    pub allow_averaging: bool,
    pub exclude_reports: bool,
    pub exclude_dividends: bool,
    pub exclude_regulatory: bool,
    pub exclude_held: bool,
    pub exclude_blacklisted: bool,
    /// Offset of the exchange clock used for scheduled starts
    pub exchange_utc_offset_hours: i32,
    pub redis_url: Option<String>,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            price_min: 1.0,
            price_max: 300.0,
            purchase_volume: 1000.0,
            purchase_parts: 10,
            change_percent: 1.0,
            take_profit_percent: 1.0,
            approximation_factor: 0.65,
            spike_protection: 2,
            close_price_protection_percent: 0.0,
            min_tick_volume: 100,
            min_day_volume: 5000,
            reset_interval_seconds: 300,
            sweep_interval_seconds: 1,
            order_lifetime_seconds: 120,
            allow_averaging: false,
            exclude_reports: true,
            exclude_dividends: true,
            exclude_regulatory: true,
            exclude_held: true,
            exclude_blacklisted: true,
            exchange_utc_offset_hours: 3,
            redis_url: None,
        }
    }
}

impl StrategySettings {
    /// Load settings from `path` (missing file is fine) plus environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();

        let settings: StrategySettings = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;

        tracing::debug!(path = %path, "Loaded strategy settings");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let numeric = [
            ("price_min", self.price_min),
            ("price_max", self.price_max),
            ("purchase_volume", self.purchase_volume),
            ("change_percent", self.change_percent),
            ("take_profit_percent", self.take_profit_percent),
            ("close_price_protection_percent", self.close_price_protection_percent),
        ];
        if let Some(&(field, value)) = numeric.iter().find(|(_, v)| !v.is_finite()) {
            return Err(invalid(field, format!("{} is not a finite number", value)));
        }
        if self.purchase_parts == 0 {
            return Err(invalid("purchase_parts", "must be greater than zero"));
        }
        if !(self.approximation_factor > 0.0 && self.approximation_factor <= 1.0) {
            return Err(invalid(
                "approximation_factor",
                format!("{} is outside (0, 1]", self.approximation_factor),
            ));
        }
        if self.reset_interval_seconds == 0 {
            return Err(invalid("reset_interval_seconds", "must be greater than zero"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(invalid("sweep_interval_seconds", "must be greater than zero"));
        }
        if self.price_min > self.price_max {
            return Err(invalid(
                "price_min",
                format!("{} exceeds price_max {}", self.price_min, self.price_max),
            ));
        }
        if self.purchase_volume < 0.0 {
            return Err(invalid("purchase_volume", "must not be negative"));
        }
        if self.take_profit_percent < 0.0 {
            return Err(invalid("take_profit_percent", "must not be negative"));
        }
        if self.close_price_protection_percent < 0.0 {
            return Err(invalid(
                "close_price_protection_percent",
                "must not be negative",
            ));
        }
        if !(-12..=14).contains(&self.exchange_utc_offset_hours) {
            return Err(invalid(
                "exchange_utc_offset_hours",
                format!("{} is not a valid UTC offset", self.exchange_utc_offset_hours),
            ));
        }
        Ok(())
    }

    /// Capital allotted to one part, in the secondary currency
    pub fn per_part_capital(&self) -> f64 {
        self.purchase_volume / self.purchase_parts.max(1) as f64
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn order_lifetime(&self) -> Duration {
        Duration::from_secs(self.order_lifetime_seconds)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> StrategyError {
    StrategyError::InvalidSetting {
        field,
        reason: reason.into(),
    }
}
