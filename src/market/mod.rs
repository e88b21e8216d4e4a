// Collaborator interfaces consumed by the strategy core
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{Candle, HeldPosition, Instrument};

/// Live instrument snapshots plus the cross-currency exchange rate
pub trait MarketData: Send + Sync {
    /// Every instrument the feed knows about
    fn instruments(&self) -> Vec<Arc<Instrument>>;

    /// Latest snapshot for one instrument
    fn instrument(&self, ticker: &str) -> Option<Arc<Instrument>>;

    /// Units of primary currency per one unit of secondary currency
    fn exchange_rate(&self) -> f64;
}

/// Read-only view of positions held in the external portfolio
pub trait Portfolio: Send + Sync {
    fn positions(&self) -> Vec<HeldPosition>;

    fn holds(&self, ticker: &str) -> bool {
        self.positions().iter().any(|p| p.ticker == ticker)
    }
}

/// Read-only list of blocked identifiers
pub trait Blacklist: Send + Sync {
    fn blocked(&self) -> Vec<String>;

    fn is_blocked(&self, ticker: &str) -> bool {
        self.blocked().iter().any(|t| t == ticker)
    }
}

/// Thread-safe in-memory market snapshot store
///
/// Snapshots are copy-on-write: readers keep the `Arc` they were handed
/// while appends publish a fresh snapshot.
#[derive(Default)]
pub struct InMemoryMarket {
    instruments: RwLock<HashMap<String, Arc<Instrument>>>,
    exchange_rate: RwLock<f64>,
}

impl InMemoryMarket {
    pub fn new(exchange_rate: f64) -> Self {
        Self {
            instruments: RwLock::new(HashMap::new()),
            exchange_rate: RwLock::new(exchange_rate),
        }
    }

    pub fn with_instruments(instruments: Vec<Instrument>, exchange_rate: f64) -> Self {
        let market = Self::new(exchange_rate);
        for instrument in instruments {
            market.upsert(instrument);
        }
        market
    }

    pub fn upsert(&self, instrument: Instrument) {
        self.instruments
            .write()
            .insert(instrument.ticker.clone(), Arc::new(instrument));
    }

    /// Append a minute candle and roll the live price and day volume forward
    ///
    /// Returns the new snapshot, or `None` for an unknown ticker.
    pub fn push_candle(&self, ticker: &str, candle: Candle) -> Option<Arc<Instrument>> {
        let mut instruments = self.instruments.write();
        let current = instruments.get(ticker)?;

        let mut next = Instrument::clone(current);
        next.price = candle.close;
        next.day_volume += candle.volume;
        next.minute_candles.push(candle);

        let next = Arc::new(next);
        instruments.insert(ticker.to_string(), next.clone());
        Some(next)
    }

    pub fn set_exchange_rate(&self, rate: f64) {
        *self.exchange_rate.write() = rate;
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }
}

impl MarketData for InMemoryMarket {
    fn instruments(&self) -> Vec<Arc<Instrument>> {
        let mut all: Vec<_> = self.instruments.read().values().cloned().collect();
        all.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        all
    }

    fn instrument(&self, ticker: &str) -> Option<Arc<Instrument>> {
        self.instruments.read().get(ticker).cloned()
    }

    fn exchange_rate(&self) -> f64 {
        *self.exchange_rate.read()
    }
}

/// Mutable set of tickers, usable as a portfolio view or a blacklist
#[derive(Debug, Default)]
pub struct TickerSet {
    tickers: RwLock<HashSet<String>>,
}

impl TickerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tickers<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tickers: RwLock::new(tickers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, ticker: impl Into<String>) -> bool {
        self.tickers.write().insert(ticker.into())
    }

    pub fn remove(&self, ticker: &str) -> bool {
        self.tickers.write().remove(ticker)
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.read().contains(ticker)
    }
}

impl Portfolio for TickerSet {
    fn positions(&self) -> Vec<HeldPosition> {
        self.tickers
            .read()
            .iter()
            .map(|ticker| HeldPosition {
                ticker: ticker.clone(),
                lots: 1,
            })
            .collect()
    }

    fn holds(&self, ticker: &str) -> bool {
        self.contains(ticker)
    }
}

impl Blacklist for TickerSet {
    fn blocked(&self) -> Vec<String> {
        self.tickers.read().iter().cloned().collect()
    }

    fn is_blocked(&self, ticker: &str) -> bool {
        self.contains(ticker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;
    use chrono::Utc;

    #[test]
    fn test_push_candle_publishes_new_snapshot() {
        let market = InMemoryMarket::with_instruments(
            vec![Instrument::new("AAPL", Currency::Secondary, 100.0)],
            90.0,
        );

        let before = market.instrument("AAPL").unwrap();
        let after = market
            .push_candle("AAPL", Candle::new(Utc::now(), 101.0, 300))
            .unwrap();

        // Old snapshot untouched
        assert!(before.minute_candles.is_empty());
        assert_eq!(before.price, 100.0);

        assert_eq!(after.minute_candles.len(), 1);
        assert_eq!(after.price, 101.0);
        assert_eq!(after.day_volume, 300);
        assert_eq!(market.instrument("AAPL").unwrap().day_volume, 300);
    }

    #[test]
    fn test_push_candle_unknown_ticker() {
        let market = InMemoryMarket::new(90.0);
        assert!(market
            .push_candle("NOPE", Candle::new(Utc::now(), 1.0, 1))
            .is_none());
        assert!(market.is_empty());
    }

    #[test]
    fn test_ticker_set_as_portfolio_and_blacklist() {
        let set = TickerSet::from_tickers(["AAPL", "TSLA"]);

        assert!(Portfolio::holds(&set, "AAPL"));
        assert!(!Portfolio::holds(&set, "MSFT"));
        assert!(Blacklist::is_blocked(&set, "TSLA"));
        assert_eq!(set.positions().len(), 2);

        set.remove("TSLA");
        assert!(!Blacklist::is_blocked(&set, "TSLA"));
    }

    #[test]
    fn test_exchange_rate_update() {
        let market = InMemoryMarket::new(90.0);
        market.set_exchange_rate(95.5);
        assert_eq!(market.exchange_rate(), 95.5);
    }
}
