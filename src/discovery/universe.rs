use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::StrategySettings;
use crate::models::{Currency, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sorting {
    Ascending,
    Descending,
}

impl Sorting {
    pub fn toggled(self) -> Self {
        match self {
            Sorting::Ascending => Sorting::Descending,
            Sorting::Descending => Sorting::Ascending,
        }
    }
}

/// Universe filter
///
/// Keeps instruments priced strictly inside the bounds. Instruments with no
/// price yet are kept too; the candidate builder drops them later if the
/// price never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniverseFilter {
    pub price_min: f64,
    pub price_max: f64,
}

impl UniverseFilter {
    pub fn from_settings(settings: &StrategySettings) -> Self {
        Self {
            price_min: settings.price_min,
            price_max: settings.price_max,
        }
    }

    pub fn accepts(&self, instrument: &Instrument) -> bool {
        let price = instrument.price_now();
        let in_range = (price > self.price_min && price < self.price_max) || price == 0.0;

        // Secondary-currency day change is measured from the session close
        let has_reference = instrument.currency != Currency::Secondary
            || instrument.close_prices.end_of_session != 0.0;

        in_range && has_reference && instrument.short_enabled
    }

    /// Filter the full snapshot set, ordered by daily change ascending
    pub fn apply(&self, instruments: &[Arc<Instrument>]) -> Vec<Arc<Instrument>> {
        let mut universe: Vec<Arc<Instrument>> = instruments
            .iter()
            .filter(|i| self.accepts(i))
            .cloned()
            .collect();
        sort_by_change(&mut universe, Sorting::Ascending);

        tracing::debug!(
            total = instruments.len(),
            eligible = universe.len(),
            "Universe filtered"
        );
        universe
    }
}

fn day_change(instrument: &Instrument) -> f64 {
    let change = instrument.day_change_percent();
    if change.is_nan() {
        0.0
    } else {
        change
    }
}

fn compare_change(a: &Instrument, b: &Instrument, sorting: Sorting) -> Ordering {
    let ordering = day_change(a).total_cmp(&day_change(b));
    match sorting {
        Sorting::Ascending => ordering,
        Sorting::Descending => ordering.reverse(),
    }
}

pub fn sort_by_change(instruments: &mut [Arc<Instrument>], sorting: Sorting) {
    instruments.sort_by(|a, b| compare_change(a, b, sorting));
}

/// Order the universe with selected instruments grouped first
pub fn sort_selected_first<F>(instruments: &mut [Arc<Instrument>], sorting: Sorting, is_selected: F)
where
    F: Fn(&str) -> bool,
{
    instruments.sort_by(|a, b| {
        is_selected(&b.ticker)
            .cmp(&is_selected(&a.ticker))
            .then_with(|| compare_change(a, b, sorting))
    });
}
