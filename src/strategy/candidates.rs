use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StrategySettings;
use crate::error::{Result, StrategyError};
use crate::market::{Blacklist, Portfolio};
use crate::models::{Currency, Instrument, PurchaseCandidate};

/// Lot counts above this come from stale or near-zero prices
pub const LOT_CEILING: u64 = 99_999_999;

/// Exclusion toggles, each an independent removal predicate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exclusions {
    pub reports: bool,
    pub dividends: bool,
    pub regulatory: bool,
    pub held: bool,
    pub blacklisted: bool,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self {
            reports: true,
            dividends: true,
            regulatory: true,
            held: true,
            blacklisted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateParams {
    /// Total capital in the secondary currency
    pub total_capital: f64,
    pub parts: usize,
    /// Threshold for candidates without a carried-forward override
    pub threshold_percent: f64,
    pub exclusions: Exclusions,
}

impl CandidateParams {
    pub fn from_settings(settings: &StrategySettings, threshold_percent: f64) -> Self {
        Self {
            total_capital: settings.purchase_volume,
            parts: settings.purchase_parts,
            threshold_percent,
            exclusions: Exclusions {
                reports: settings.exclude_reports,
                dividends: settings.exclude_dividends,
                regulatory: settings.exclude_regulatory,
                held: settings.exclude_held,
                blacklisted: settings.exclude_blacklisted,
            },
        }
    }
}

/// Lots one part of capital buys at `price`, if within sanity bounds
///
/// # Arguments
/// * `per_part_capital` - One part of capital, in the secondary currency
/// * `currency` - Quote currency of the instrument
/// * `exchange_rate` - Primary units per secondary unit
pub fn lots_for(
    per_part_capital: f64,
    currency: Currency,
    exchange_rate: f64,
    price: f64,
) -> Option<u64> {
    let capital = match currency {
        Currency::Primary => per_part_capital * exchange_rate,
        Currency::Secondary => per_part_capital,
    };
    let lots = (capital / price).round();

    if !lots.is_finite() || lots < 1.0 || lots > LOT_CEILING as f64 {
        return None;
    }
    Some(lots as u64)
}

/// Turn the selected instruments into sized purchase candidates
///
/// Thresholds set on the previous list are carried forward by ticker. The
/// result is returned whole; callers publish it in one swap.
pub fn build_candidates(
    selected: &[Arc<Instrument>],
    previous: &[PurchaseCandidate],
    params: &CandidateParams,
    exchange_rate: f64,
    portfolio: &dyn Portfolio,
    blacklist: &dyn Blacklist,
) -> Result<Vec<PurchaseCandidate>> {
    if params.parts == 0 {
        return Err(StrategyError::InvalidSetting {
            field: "purchase_parts",
            reason: "must be greater than zero".to_string(),
        });
    }

    let per_part = params.total_capital / params.parts as f64;
    let carried: HashMap<&str, f64> = previous
        .iter()
        .map(|c| (c.ticker.as_str(), c.threshold_percent))
        .collect();

    let mut candidates = Vec::with_capacity(selected.len());
    for instrument in selected {
        let price = instrument.price_now();
        let Some(lots) = lots_for(per_part, instrument.currency, exchange_rate, price) else {
            tracing::debug!(ticker = %instrument.ticker, price, "Dropped: lot count out of range");
            continue;
        };

        let threshold = carried
            .get(instrument.ticker.as_str())
            .copied()
            .unwrap_or(params.threshold_percent);

        let mut candidate =
            PurchaseCandidate::new(instrument.ticker.clone(), instrument.currency, threshold);
        candidate.lots = lots;
        candidates.push((candidate, instrument));
    }

    let exclusions = params.exclusions;
    let built: Vec<PurchaseCandidate> = candidates
        .into_iter()
        .filter(|(_, i)| !(exclusions.reports && i.events.earnings))
        .filter(|(_, i)| !(exclusions.dividends && i.events.dividend))
        .filter(|(_, i)| !(exclusions.regulatory && i.events.regulatory))
        .filter(|(_, i)| !(exclusions.held && portfolio.holds(&i.ticker)))
        .filter(|(_, i)| !(exclusions.blacklisted && blacklist.is_blocked(&i.ticker)))
        .map(|(candidate, _)| candidate)
        .collect();

    tracing::info!(
        selected = selected.len(),
        built = built.len(),
        per_part_capital = per_part,
        "📋 Purchase candidates built"
    );

    Ok(built)
}
