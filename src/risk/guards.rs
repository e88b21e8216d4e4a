use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Candle, Currency, Instrument};

/// Pre-submission guards applied to an admitted sell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGuards {
    /// Prior candles that must all close below the sell price, 0 disables
    pub spike_window: usize,
    /// Close-price guard percent, 0 disables
    pub close_price_protection_percent: f64,
}

impl Default for RiskGuards {
    fn default() -> Self {
        Self {
            spike_window: 2,
            close_price_protection_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardTrip {
    /// A recent candle already traded at or above the sell price
    Spike {
        close: f64,
        timestamp: DateTime<Utc>,
    },
    /// The sell price falls on the wrong side of the session reference
    ClosePrice { sell_price: f64, limit: f64 },
}

impl RiskGuards {
    /// Spike protection over the candles strictly older than `trigger`
    ///
    /// Walks back from the most recent prior candle through at most
    /// `spike_window` candles. Skipped entirely when the history is shorter
    /// than the window (counting the trigger itself).
    pub fn check_spike(
        &self,
        history: &[Candle],
        trigger: &Candle,
        sell_price: f64,
    ) -> Result<(), GuardTrip> {
        if self.spike_window == 0 {
            return Ok(());
        }

        let mut prior: Vec<&Candle> = history
            .iter()
            .filter(|c| c.timestamp < trigger.timestamp)
            .collect();
        if prior.len() + 1 < self.spike_window {
            return Ok(());
        }
        prior.sort_by_key(|c| c.timestamp);

        for candle in prior.iter().rev().take(self.spike_window) {
            if !(candle.close < sell_price) {
                return Err(GuardTrip::Spike {
                    close: candle.close,
                    timestamp: candle.timestamp,
                });
            }
        }

        Ok(())
    }

    /// Close-price guard against the session references
    ///
    /// Primary-currency instruments must sell below today's open;
    /// secondary-currency instruments must sell above the previous session
    /// close plus the protection margin.
    pub fn check_close_price(
        &self,
        instrument: &Instrument,
        sell_price: f64,
    ) -> Result<(), GuardTrip> {
        if self.close_price_protection_percent == 0.0 {
            return Ok(());
        }

        match instrument.currency {
            Currency::Primary => {
                let limit = instrument.close_prices.open;
                if sell_price >= limit {
                    return Err(GuardTrip::ClosePrice { sell_price, limit });
                }
            }
            Currency::Secondary => {
                let close = instrument.close_prices.end_of_session;
                let limit = close * (1.0 + self.close_price_protection_percent / 100.0);
                if sell_price <= limit {
                    return Err(GuardTrip::ClosePrice { sell_price, limit });
                }
            }
        }

        Ok(())
    }
}
