use crate::models::{Candle, Currency, Instrument};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Market scenario types for synthetic minute data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum MarketScenario {
    /// Steady climb, roughly +0.3% per minute with noise
    Rally,
    /// Mean-reverting chop around the session close
    Sideways,
    /// Large swings in both directions (±3% per minute)
    Volatile,
    /// Quiet market with one-minute jumps that revert immediately
    Spiky,
}

/// Generates synthetic instruments and minute candles
pub struct SyntheticMarket {
    rng: StdRng,
    base_volume: f64,
}

impl SyntheticMarket {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_volume: 800.0,
        }
    }

    /// Generate `count` shortable instruments priced inside `(price_min, price_max)`
    ///
    /// Every fourth instrument trades in the primary currency; the rest use
    /// the secondary currency. Session closes equal the opening price so the
    /// day change starts at zero.
    pub fn instruments(&mut self, count: usize, price_min: f64, price_max: f64) -> Vec<Instrument> {
        let low = price_min.max(1.0);
        let high = if price_max > low { price_max } else { low * 2.0 };
        // Stay clear of the exclusive bounds; a narrow band collapses to its midpoint
        let (from, to) = (low + (high - low) * 0.1, high - (high - low) * 0.1);

        (0..count)
            .map(|i| {
                let currency = if i % 4 == 3 {
                    Currency::Primary
                } else {
                    Currency::Secondary
                };
                let price = if from < to {
                    round_cents(self.rng.gen_range(from..to))
                } else {
                    round_cents((low + high) / 2.0)
                };

                let mut instrument = Instrument::new(format!("SYN{:02}", i + 1), currency, price);
                instrument.close_prices.open = price;
                instrument.close_prices.end_of_session = price;
                instrument.day_volume = self.rng.gen_range(5_000..50_000);
                instrument
            })
            .collect()
    }

    /// Generate one candle per minute starting at `start`
    pub fn candles(
        &mut self,
        scenario: MarketScenario,
        base_price: f64,
        num_candles: usize,
        start: DateTime<Utc>,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);
        let mut current_price = base_price;

        for i in 0..num_candles {
            let timestamp = start + Duration::minutes(i as i64);

            let close = match scenario {
                MarketScenario::Rally => {
                    let drift = current_price * 0.003;
                    let noise = current_price * self.rng.gen_range(-0.001..0.001);
                    current_price += drift + noise;
                    current_price
                }
                MarketScenario::Sideways => {
                    // 10% pull back to the session close
                    let reversion = (base_price - current_price) * 0.1;
                    let noise = current_price * self.rng.gen_range(-0.01..0.01);
                    current_price += reversion + noise;
                    current_price
                }
                MarketScenario::Volatile => {
                    let change = current_price * self.rng.gen_range(-0.03..0.03);
                    current_price = (current_price + change).max(base_price * 0.5);
                    current_price
                }
                MarketScenario::Spiky => {
                    current_price += current_price * self.rng.gen_range(-0.001..0.001);
                    if self.rng.gen_bool(0.05) {
                        // Jump for this minute only
                        current_price * self.rng.gen_range(1.02..1.06)
                    } else {
                        current_price
                    }
                }
            };

            let candle = self.create_candle(close, timestamp);
            candles.push(candle);
        }

        candles
    }

    fn create_candle(&mut self, price: f64, timestamp: DateTime<Utc>) -> Candle {
        // Vary volume ±50%
        let volume = (self.base_volume * self.rng.gen_range(0.5..1.5)).round() as u64;
        Candle::new(timestamp, round_cents(price.max(0.01)), volume)
    }
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
