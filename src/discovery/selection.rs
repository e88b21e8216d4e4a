use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::universe::{sort_by_change, sort_selected_first, Sorting, UniverseFilter};
use crate::error::Result;
use crate::models::Instrument;
use crate::persistence::SelectionStore;

/// Named selection sets, each persisted under its own key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionSet {
    Set1,
    Set2,
    Set3,
    /// Hand-curated favourites shared with other strategies
    Favorites,
}

impl SelectionSet {
    pub const ALL: [SelectionSet; 4] = [
        SelectionSet::Set1,
        SelectionSet::Set2,
        SelectionSet::Set3,
        SelectionSet::Favorites,
    ];

    pub fn key(self) -> &'static str {
        match self {
            SelectionSet::Set1 => "umbrella_set_1",
            SelectionSet::Set2 => "umbrella_set_2",
            SelectionSet::Set3 => "umbrella_set_3",
            SelectionSet::Favorites => "favorites_set",
        }
    }

    /// 1-based set number as shown to users
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(SelectionSet::Set1),
            2 => Some(SelectionSet::Set2),
            3 => Some(SelectionSet::Set3),
            4 => Some(SelectionSet::Favorites),
            _ => None,
        }
    }
}

pub fn parse_members(value: &str) -> Vec<String> {
    let mut members: Vec<String> = Vec::new();
    for ticker in value.split_whitespace() {
        if !members.iter().any(|m| m == ticker) {
            members.push(ticker.to_string());
        }
    }
    members
}

/// Curated subset of the universe backed by a [`SelectionStore`]
pub struct SelectionManager<S: SelectionStore> {
    store: S,
    filter: UniverseFilter,
    set: SelectionSet,
    universe: Vec<Arc<Instrument>>,
    selected: Vec<Arc<Instrument>>,
    sorting: Sorting,
}

impl<S: SelectionStore> SelectionManager<S> {
    pub fn new(store: S, filter: UniverseFilter) -> Self {
        Self {
            store,
            filter,
            set: SelectionSet::Set1,
            universe: Vec::new(),
            selected: Vec::new(),
            sorting: Sorting::Descending,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn active_set(&self) -> SelectionSet {
        self.set
    }

    /// Filter the universe from `instruments` and load `set` over it
    ///
    /// Stored tickers that are not in the universe are left out.
    pub async fn process(
        &mut self,
        instruments: &[Arc<Instrument>],
        set: SelectionSet,
    ) -> Result<()> {
        self.universe = self.filter.apply(instruments);
        self.set = set;

        let stored = self.store.load(set.key()).await?.unwrap_or_default();
        let members = parse_members(&stored);

        self.selected = self
            .universe
            .iter()
            .filter(|i| members.iter().any(|m| *m == i.ticker))
            .cloned()
            .collect();

        tracing::info!(
            set = ?set,
            universe = self.universe.len(),
            selected = self.selected.len(),
            "Selection loaded"
        );
        Ok(())
    }

    /// Add or remove `ticker` and persist the set
    ///
    /// Returns false when nothing changed: adding a member twice or removing
    /// an absent one is a no-op. Tickers outside the universe cannot be added.
    pub async fn toggle(&mut self, ticker: &str, selected: bool) -> Result<bool> {
        let position = self.selected.iter().position(|i| i.ticker == ticker);

        let changed = match (selected, position) {
            (true, None) => match self.universe.iter().find(|i| i.ticker == ticker) {
                Some(instrument) => {
                    self.selected.push(instrument.clone());
                    true
                }
                None => {
                    tracing::debug!(ticker = %ticker, "Not in universe, cannot select");
                    false
                }
            },
            (false, Some(index)) => {
                self.selected.remove(index);
                true
            }
            _ => false,
        };

        if !changed {
            return Ok(false);
        }

        sort_by_change(&mut self.selected, Sorting::Ascending);
        self.store.save(self.set.key(), &self.serialized()).await?;
        Ok(true)
    }

    /// Space-joined member list, as persisted
    pub fn serialized(&self) -> String {
        self.selected
            .iter()
            .map(|i| i.ticker.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_selected(&self, ticker: &str) -> bool {
        self.selected.iter().any(|i| i.ticker == ticker)
    }

    pub fn selected(&self) -> &[Arc<Instrument>] {
        &self.selected
    }

    pub fn universe(&self) -> &[Arc<Instrument>] {
        &self.universe
    }

    /// Flip the universe order, keeping selected instruments first
    pub fn resort(&mut self) -> &[Arc<Instrument>] {
        self.sorting = self.sorting.toggled();
        let selected: Vec<String> = self.selected.iter().map(|i| i.ticker.clone()).collect();
        sort_selected_first(&mut self.universe, self.sorting, |t| {
            selected.iter().any(|s| s == t)
        });
        &self.universe
    }
}
