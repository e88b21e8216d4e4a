use serde::Serialize;

use crate::models::Candle;

/// Step applied by a threshold nudge, in percent
pub const PERCENT_DELTA: f64 = 0.05;

/// Moves above this are treated as bad data
pub const MAX_PLAUSIBLE_CHANGE_PERCENT: f64 = 50.0;

/// Why a tick was not admitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Rejection {
    ZeroReference,
    InvalidPrice,
    InvalidThreshold,
    Implausible { change: f64 },
    Falling { change: f64 },
    BelowThreshold { change: f64, threshold: f64 },
    LowTickVolume { volume: u64, min: u64 },
    LowDayVolume { volume: u64, min: u64 },
    CapReached { in_flight: usize, cap: usize },
    AlreadyHeld,
    AlreadyInFlight,
}

/// Percent change of `close` against `reference`
///
/// Returns `None` when the reference is not a usable price or the result
/// is not finite, so a zero baseline can never admit a tick.
pub fn change_percent(close: f64, reference: f64) -> Option<f64> {
    if !(reference > 0.0) {
        return None;
    }
    let change = close / reference * 100.0 - 100.0;
    change.is_finite().then_some(change)
}

/// Price and volume part of the admission gate
#[derive(Debug, Clone, Copy)]
pub struct MoveCheck {
    pub min_tick_volume: u64,
    pub min_day_volume: u64,
}

impl MoveCheck {
    /// Check a tick against its baseline and threshold
    ///
    /// # Returns
    /// The percent change on admission, or the first failed check in gate
    /// order: zero reference, unusable price or threshold, implausible move,
    /// falling price, below threshold, thin tick, thin day.
    pub fn evaluate(
        &self,
        reference: f64,
        threshold: f64,
        tick: &Candle,
        day_volume: u64,
    ) -> Result<f64, Rejection> {
        if reference == 0.0 {
            return Err(Rejection::ZeroReference);
        }
        let change = change_percent(tick.close, reference).ok_or(Rejection::InvalidPrice)?;
        if !threshold.is_finite() {
            return Err(Rejection::InvalidThreshold);
        }

        if change.abs() > MAX_PLAUSIBLE_CHANGE_PERCENT {
            return Err(Rejection::Implausible { change });
        }
        if change < 0.0 {
            return Err(Rejection::Falling { change });
        }
        if change < threshold {
            return Err(Rejection::BelowThreshold { change, threshold });
        }
        if tick.volume < self.min_tick_volume {
            return Err(Rejection::LowTickVolume {
                volume: tick.volume,
                min: self.min_tick_volume,
            });
        }
        if day_volume < self.min_day_volume {
            return Err(Rejection::LowDayVolume {
                volume: day_volume,
                min: self.min_day_volume,
            });
        }

        Ok(change)
    }
}

/// Percent above the baseline where the limit is placed
///
/// The excess over the threshold is scaled by `factor`, pulling the limit
/// toward the tick's extreme but short of it.
pub fn adjusted_percent(change: f64, threshold: f64, factor: f64) -> f64 {
    let delta = (change.abs() - threshold.abs()) * factor;
    threshold.abs() + delta
}

pub fn sell_price(reference: f64, adjusted_percent: f64) -> f64 {
    reference + reference * adjusted_percent / 100.0
}

/// Take profit for a new order
///
/// Averaging into an in-flight order leaves the final average price
/// unknown, so no fixed target is set.
pub fn take_profit(configured: f64, averaged: bool, allow_averaging: bool) -> f64 {
    if averaged && allow_averaging {
        0.0
    } else {
        configured
    }
}

/// Round to the nearest multiple of the instrument's price increment
pub fn round_to_increment(price: f64, increment: f64) -> f64 {
    if !(increment > 0.0) || !price.is_finite() {
        return price;
    }
    let rounded = (price / increment).round() * increment;

    // Strip float noise left by the multiplication
    let scale = 10f64.powi(increment_decimals(increment));
    (rounded * scale).round() / scale
}

/// Decimal places needed to write `increment` exactly, e.g. 2 for 0.25
fn increment_decimals(increment: f64) -> i32 {
    (0..=12)
        .find(|&d| {
            let scaled = increment * 10f64.powi(d);
            (scaled - scaled.round()).abs() < 1e-6
        })
        .unwrap_or(12)
}

/// Buy-back target reported alongside a triggered sell
pub fn buyback_price(sell_price: f64, take_profit_percent: f64, increment: f64) -> f64 {
    round_to_increment(sell_price * (1.0 - take_profit_percent / 100.0), increment)
}
