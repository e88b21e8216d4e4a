use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quote currency of an instrument
///
/// Capital is allocated in the secondary currency; primary-currency
/// instruments are sized through the exchange rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Currency {
    Primary,
    Secondary,
}

/// One minute candle. Immutable once appended to an instrument's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    pub fn new(timestamp: DateTime<Utc>, close: f64, volume: u64) -> Self {
        Self {
            timestamp,
            close,
            volume,
        }
    }
}

/// The two daily reference checkpoints published by the market-data feed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ClosePrices {
    /// Today's opening reference price
    pub open: f64,
    /// Previous end-of-session reference price
    pub end_of_session: f64,
}

/// Upcoming corporate/regulatory events that can exclude an instrument
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventFlags {
    pub earnings: bool,
    pub dividend: bool,
    pub regulatory: bool,
}

/// Live snapshot of a tradable instrument, owned by the market-data feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub ticker: String,
    pub currency: Currency,
    pub price: f64,
    pub close_prices: ClosePrices,
    /// Oldest first, most recent last
    pub minute_candles: Vec<Candle>,
    pub day_volume: u64,
    pub short_enabled: bool,
    pub min_price_increment: f64,
    pub events: EventFlags,
}

impl Instrument {
    pub fn new(ticker: impl Into<String>, currency: Currency, price: f64) -> Self {
        Self {
            ticker: ticker.into(),
            currency,
            price,
            close_prices: ClosePrices::default(),
            minute_candles: Vec::new(),
            day_volume: 0,
            short_enabled: true,
            min_price_increment: 0.01,
            events: EventFlags::default(),
        }
    }

    /// Current price: the live quote, or the last close if no quote arrived yet
    pub fn price_now(&self) -> f64 {
        if self.price > 0.0 {
            return self.price;
        }
        self.minute_candles.last().map(|c| c.close).unwrap_or(0.0)
    }

    /// Close of the most recent candle that traded at least `min_volume`
    ///
    /// Thin candles print noisy closes, so baselines are taken from the last
    /// candle with real volume. Falls back to [`Instrument::price_now`].
    pub fn qualified_price(&self, min_volume: u64) -> f64 {
        self.minute_candles
            .iter()
            .rev()
            .find(|c| c.volume >= min_volume)
            .map(|c| c.close)
            .unwrap_or_else(|| self.price_now())
    }

    /// Change in percent against the end-of-session reference, 0 if unknown
    pub fn day_change_percent(&self) -> f64 {
        let reference = self.close_prices.end_of_session;
        if reference <= 0.0 {
            return 0.0;
        }
        self.price_now() / reference * 100.0 - 100.0
    }

    pub fn last_candle(&self) -> Option<&Candle> {
        self.minute_candles.last()
    }
}

/// Position already held in the external portfolio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeldPosition {
    pub ticker: String,
    pub lots: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PurchaseStatus {
    Waiting,
    OrderPlaced,
    Filled,
    Skipped,
}

/// Sized order candidate derived from a selected instrument
///
/// References its instrument by ticker only; the instrument itself stays
/// owned by the market-data feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseCandidate {
    pub ticker: String,
    pub currency: Currency,
    pub reference_price: f64,
    pub threshold_percent: f64,
    pub lots: u64,
    pub status: PurchaseStatus,
}

impl PurchaseCandidate {
    pub fn new(ticker: impl Into<String>, currency: Currency, threshold_percent: f64) -> Self {
        Self {
            ticker: ticker.into(),
            currency,
            reference_price: 0.0,
            threshold_percent,
            lots: 0,
            status: PurchaseStatus::Waiting,
        }
    }
}
