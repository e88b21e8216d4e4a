use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::candidates::{self, CandidateParams};
use super::schedule;
use super::signals::{self, MoveCheck, Rejection, PERCENT_DELTA};
use crate::config::StrategySettings;
use crate::error::{Result, StrategyError};
use crate::execution::{
    AdmitRejection, Admission, ExecutionGateway, GatewayError, OrderHandle, OrderState,
    OrderTracker, SellLimitOrder,
};
use crate::market::{Blacklist, MarketData, Portfolio};
use crate::models::{Candle, Instrument, PurchaseCandidate, PurchaseStatus};
use crate::notify::{EventSink, SpikeEvent, StopReason, StrategyEvent, TriggerEvent};
use crate::risk::{GuardTrip, RiskGuards};

/// External collaborators the strategy reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketData>,
    pub portfolio: Arc<dyn Portfolio>,
    pub blacklist: Arc<dyn Blacklist>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Phase {
    Idle,
    Scheduled { at: DateTime<Utc> },
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyState {
    pub phase: Phase,
    /// Global threshold used for newly built candidates
    pub basic_threshold_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum IgnoreReason {
    NotRunning,
    NotInScope,
    DataUnavailable,
}

/// Result of evaluating one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Ignored(IgnoreReason),
    Rejected(Rejection),
    /// The cap was already reached when the tick arrived
    StrategyStopped { in_flight: usize, cap: usize },
    SpikeSkipped(SpikeEvent),
    GuardBlocked(GuardTrip),
    Triggered(TriggerEvent),
    SubmissionFailed(GatewayError),
}

impl TickOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, TickOutcome::Triggered(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub phase: Phase,
    pub in_flight: usize,
    pub cap: usize,
    pub per_part_capital: f64,
    pub threshold_percent: f64,
    pub take_profit_percent: f64,
    pub approximation_factor: f64,
    pub min_tick_volume: u64,
    pub candidates: usize,
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: in flight {}/{}, part {:.2}, threshold {:.2}%, take profit {:.2}%, factor {:.2}, min volume {}, candidates {}",
            self.phase,
            self.in_flight,
            self.cap,
            self.per_part_capital,
            self.threshold_percent,
            self.take_profit_percent,
            self.approximation_factor,
            self.min_tick_volume,
            self.candidates
        )
    }
}

/// A candidate's live move against its baseline
#[derive(Debug, Clone, Serialize)]
pub struct CandidateChange {
    pub ticker: String,
    pub reference_price: f64,
    pub price: f64,
    pub change_percent: f64,
    pub status: PurchaseStatus,
    pub last_volume: u64,
}

struct CandidateSlot {
    ticker: String,
    candidate: Mutex<PurchaseCandidate>,
}

#[derive(Default)]
struct Timers {
    reset: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [self.reset.take(), self.sweep.take(), self.countdown.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Shared {
    settings: StrategySettings,
    collaborators: Collaborators,
    guards: RiskGuards,
    move_check: MoveCheck,
    state: Mutex<StrategyState>,
    candidates: RwLock<Arc<[Arc<CandidateSlot>]>>,
    tracker: OrderTracker,
    timers: Mutex<Timers>,
    /// False when the caller drives baseline resets and sweeps itself
    periodic_timers: bool,
}

/// Endless umbrella strategy: baseline controller and decision engine
///
/// Cheap to clone; all clones drive the same strategy instance. Ticks may
/// be evaluated from any number of threads at once.
#[derive(Clone)]
pub struct UmbrellaStrategy {
    inner: Arc<Shared>,
}

impl UmbrellaStrategy {
    pub fn new(settings: StrategySettings, collaborators: Collaborators) -> Result<Self> {
        Self::build(settings, collaborators, true)
    }

    /// Strategy whose baseline reset and sweep are driven by the caller
    ///
    /// `start` arms no periodic timers even inside a tokio runtime; the
    /// caller invokes [`fix_baseline`](Self::fix_baseline) and
    /// [`sweep_completed`](Self::sweep_completed) on its own clock.
    /// Scheduled starts still count down in real time.
    pub fn manual(settings: StrategySettings, collaborators: Collaborators) -> Result<Self> {
        Self::build(settings, collaborators, false)
    }

    fn build(
        settings: StrategySettings,
        collaborators: Collaborators,
        periodic_timers: bool,
    ) -> Result<Self> {
        settings.validate()?;

        let guards = RiskGuards {
            spike_window: settings.spike_protection,
            close_price_protection_percent: settings.close_price_protection_percent,
        };
        let move_check = MoveCheck {
            min_tick_volume: settings.min_tick_volume,
            min_day_volume: settings.min_day_volume,
        };
        let state = StrategyState {
            phase: Phase::Idle,
            basic_threshold_percent: settings.change_percent,
        };

        Ok(Self {
            inner: Arc::new(Shared {
                settings,
                collaborators,
                guards,
                move_check,
                state: Mutex::new(state),
                candidates: RwLock::new(Arc::from(Vec::new())),
                tracker: OrderTracker::new(),
                timers: Mutex::new(Timers::default()),
                periodic_timers,
            }),
        })
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.inner.settings
    }

    pub fn state(&self) -> StrategyState {
        self.inner.state.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        match self.phase() {
            Phase::Scheduled { at } => Some(at),
            _ => None,
        }
    }

    /// Identifiers with an active order
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.active_len()
    }

    pub fn tracked_orders(&self) -> Vec<(String, Vec<OrderHandle>)> {
        self.inner.tracker.snapshot()
    }

    pub fn candidates(&self) -> Vec<PurchaseCandidate> {
        self.slots()
            .iter()
            .map(|slot| slot.candidate.lock().clone())
            .collect()
    }

    fn slots(&self) -> Arc<[Arc<CandidateSlot>]> {
        self.inner.candidates.read().clone()
    }

    fn slot(&self, ticker: &str) -> Option<Arc<CandidateSlot>> {
        self.slots().iter().find(|s| s.ticker == ticker).cloned()
    }

    /// Rebuild the candidate list from the selected instruments
    ///
    /// While running the live list is kept and returned unchanged.
    pub fn build_candidates(&self, selected: &[Arc<Instrument>]) -> Result<Vec<PurchaseCandidate>> {
        if self.is_running() {
            tracing::debug!("Strategy running, keeping live candidates");
            return Ok(self.candidates());
        }
        self.rebuild(selected, true)
    }

    fn rebuild(
        &self,
        selected: &[Arc<Instrument>],
        carry_thresholds: bool,
    ) -> Result<Vec<PurchaseCandidate>> {
        let inner = &self.inner;
        let previous = if carry_thresholds {
            self.candidates()
        } else {
            Vec::new()
        };
        let threshold = inner.state.lock().basic_threshold_percent;
        let params = CandidateParams::from_settings(&inner.settings, threshold);

        let built = candidates::build_candidates(
            selected,
            &previous,
            &params,
            inner.collaborators.market.exchange_rate(),
            inner.collaborators.portfolio.as_ref(),
            inner.collaborators.blacklist.as_ref(),
        )?;

        let slots: Arc<[Arc<CandidateSlot>]> = built
            .iter()
            .map(|c| {
                Arc::new(CandidateSlot {
                    ticker: c.ticker.clone(),
                    candidate: Mutex::new(c.clone()),
                })
            })
            .collect();
        *inner.candidates.write() = slots;

        Ok(built)
    }

    /// Set every candidate's baseline to its volume-qualified live price
    ///
    /// Candidates without a usable price keep their previous baseline.
    pub fn fix_baseline(&self) {
        let market = &self.inner.collaborators.market;
        let min_volume = self.inner.settings.min_tick_volume;
        let mut fixed = 0;

        for slot in self.slots().iter() {
            let Some(instrument) = market.instrument(&slot.ticker) else {
                tracing::debug!(ticker = %slot.ticker, "No market data, baseline kept");
                continue;
            };
            let price = instrument.qualified_price(min_volume);
            if !(price > 0.0) {
                continue;
            }
            slot.candidate.lock().reference_price = price;
            fixed += 1;
        }

        tracing::debug!(fixed, "Baselines fixed");
    }

    /// Schedule activation at the next `HH:MM:SS` on the exchange clock
    pub fn schedule_start(&self, time_of_day: &str, rollover: bool) -> Result<DateTime<Utc>> {
        let time = schedule::parse_time_of_day(time_of_day)?;
        let offset = schedule::exchange_offset(self.inner.settings.exchange_utc_offset_hours)?;

        let at = match schedule::next_start(Utc::now(), time, offset, rollover) {
            Ok(at) => at,
            Err(StrategyError::SchedulingAnomaly {
                requested,
                delay_ms,
            }) => {
                tracing::warn!(
                    requested = %requested,
                    delay_ms,
                    "Scheduled start lies in the past"
                );
                self.inner.collaborators.events.publish(StrategyEvent::SchedulingAnomaly {
                    requested: requested.clone(),
                    delay_ms,
                });
                return Err(StrategyError::SchedulingAnomaly {
                    requested,
                    delay_ms,
                });
            }
            Err(e) => return Err(e),
        };

        if self.phase() != Phase::Idle {
            self.stop_with(StopReason::Restart);
        }
        self.inner.state.lock().phase = Phase::Scheduled { at };

        let countdown = self.spawn_countdown(at);
        {
            let mut timers = self.inner.timers.lock();
            if let Some(previous) = timers.countdown.take() {
                previous.abort();
            }
            timers.countdown = countdown;
        }

        self.inner
            .collaborators
            .events
            .publish(StrategyEvent::Scheduled { at });
        Ok(at)
    }

    /// Start immediately
    pub fn start(&self, scheduled: bool) {
        self.activate(scheduled, None);
    }

    /// Move to Running, optionally only if still scheduled for `expected_at`
    fn activate(&self, scheduled: bool, expected_at: Option<DateTime<Utc>>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if let Some(at) = expected_at {
                if state.phase != (Phase::Scheduled { at }) {
                    return false;
                }
            }
            state.phase = Phase::Running;
        }

        self.fix_baseline();
        self.cancel_tracked();

        let reset = self.spawn_periodic(self.inner.settings.reset_interval(), |s| s.fix_baseline());
        let sweep = self.spawn_periodic(self.inner.settings.sweep_interval(), |s| {
            s.sweep_completed();
        });
        {
            let mut timers = self.inner.timers.lock();
            timers.abort_all();
            timers.reset = reset;
            timers.sweep = sweep;
        }

        let candidates = self.slots().len();
        self.inner
            .collaborators
            .events
            .publish(StrategyEvent::Started {
                scheduled,
                candidates,
            });
        true
    }

    pub fn stop(&self) {
        self.stop_with(StopReason::Requested);
    }

    fn stop_with(&self, reason: StopReason) {
        let previous = std::mem::replace(&mut self.inner.state.lock().phase, Phase::Idle);
        self.inner.timers.lock().abort_all();
        let cancelled = self.cancel_tracked();

        if previous == Phase::Idle && cancelled == 0 {
            tracing::debug!("Strategy already idle");
            return;
        }
        self.inner
            .collaborators
            .events
            .publish(StrategyEvent::Stopped { reason });
    }

    /// Empty the tracking table and cancel whatever is still active
    ///
    /// Cancellation failures are logged and skipped.
    fn cancel_tracked(&self) -> usize {
        let handles = self.inner.tracker.drain();
        let gateway = &self.inner.collaborators.gateway;
        let mut cancelled = 0;

        for handle in handles.iter().filter(|h| h.is_active()) {
            match gateway.cancel(handle) {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    tracing::warn!(ticker = %handle.ticker(), error = %e, "Failed to cancel order");
                }
            }
        }

        if !handles.is_empty() {
            tracing::info!(tracked = handles.len(), cancelled, "Tracking table cleared");
        }
        cancelled
    }

    /// Stop, optionally replace the global threshold, rebuild and start
    ///
    /// A new threshold applies to every candidate, dropping per-candidate
    /// overrides.
    pub fn restart(
        &self,
        selected: &[Arc<Instrument>],
        new_threshold_percent: Option<f64>,
    ) -> Result<Vec<PurchaseCandidate>> {
        if let Some(percent) = new_threshold_percent {
            if !percent.is_finite() {
                return Err(StrategyError::InvalidSetting {
                    field: "change_percent",
                    reason: format!("{} is not a number", percent),
                });
            }
        }

        if self.phase() != Phase::Idle {
            self.stop_with(StopReason::Restart);
        }
        if let Some(percent) = new_threshold_percent {
            self.inner.state.lock().basic_threshold_percent = percent;
        }

        let built = self.rebuild(selected, new_threshold_percent.is_none())?;
        self.start(false);
        Ok(built)
    }

    /// Nudge the global and every candidate threshold by one step
    ///
    /// Each candidate is then re-evaluated against its latest candle.
    pub fn adjust_global_threshold(&self, sign: i32) -> Vec<(String, TickOutcome)> {
        let step = f64::from(sign.signum()) * PERCENT_DELTA;
        if step == 0.0 {
            return Vec::new();
        }

        let threshold = {
            let mut state = self.inner.state.lock();
            state.basic_threshold_percent += step;
            state.basic_threshold_percent
        };
        let slots = self.slots();
        for slot in slots.iter() {
            slot.candidate.lock().threshold_percent += step;
        }
        tracing::info!(threshold, "Global threshold adjusted");

        let market = &self.inner.collaborators.market;
        slots
            .iter()
            .filter_map(|slot| {
                let instrument = market.instrument(&slot.ticker)?;
                let last = instrument.last_candle()?.clone();
                Some((slot.ticker.clone(), self.on_tick(&slot.ticker, &last)))
            })
            .collect()
    }

    /// Evaluate one tick for `ticker`
    ///
    /// Never fails: every problem is contained in the returned outcome.
    pub fn on_tick(&self, ticker: &str, tick: &Candle) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Ignored(IgnoreReason::NotRunning);
        }
        let Some(slot) = self.slot(ticker) else {
            return TickOutcome::Ignored(IgnoreReason::NotInScope);
        };
        let inner = &self.inner;
        let Some(instrument) = inner.collaborators.market.instrument(ticker) else {
            return TickOutcome::Ignored(IgnoreReason::DataUnavailable);
        };
        let settings = &inner.settings;
        let cap = settings.purchase_parts;

        // Held for the whole evaluation so baseline fixes cannot interleave
        let mut candidate = slot.candidate.lock();
        let reference = candidate.reference_price;
        let threshold = candidate.threshold_percent;

        let change = match inner
            .move_check
            .evaluate(reference, threshold, tick, instrument.day_volume)
        {
            Ok(change) => change,
            Err(rejection) => {
                tracing::trace!(ticker = %ticker, reason = ?rejection, "Tick rejected");
                return TickOutcome::Rejected(rejection);
            }
        };

        let in_flight = inner.tracker.active_len();
        if in_flight >= cap {
            drop(candidate);
            tracing::info!(in_flight, cap, "All parts in flight, stopping");
            self.stop_with(StopReason::CapReached { in_flight, cap });
            return TickOutcome::StrategyStopped { in_flight, cap };
        }

        if !settings.allow_averaging {
            if inner.collaborators.portfolio.holds(ticker) {
                return TickOutcome::Rejected(Rejection::AlreadyHeld);
            }
            if inner.tracker.contains(ticker) {
                return TickOutcome::Rejected(Rejection::AlreadyInFlight);
            }
        }

        let adjusted = signals::adjusted_percent(change, threshold, settings.approximation_factor);
        let sell = signals::sell_price(reference, adjusted);

        if let Err(trip) = inner
            .guards
            .check_spike(&instrument.minute_candles, tick, sell)
        {
            let spike_close = match trip {
                GuardTrip::Spike { close, .. } => close,
                GuardTrip::ClosePrice { .. } => tick.close,
            };
            candidate.reference_price = tick.close;
            candidate.status = PurchaseStatus::Skipped;

            let event = SpikeEvent {
                ticker: ticker.to_string(),
                reference_before: reference,
                close: tick.close,
                sell_price: sell,
                spike_close,
            };
            inner
                .collaborators
                .events
                .publish(StrategyEvent::SpikeSkipped(event.clone()));
            return TickOutcome::SpikeSkipped(event);
        }

        if let Err(trip) = inner.guards.check_close_price(&instrument, sell) {
            tracing::debug!(ticker = %ticker, trip = ?trip, "Close-price guard blocked sell");
            return TickOutcome::GuardBlocked(trip);
        }

        let increment = instrument.min_price_increment;
        let price = signals::round_to_increment(sell, increment);
        let mut take_profit = settings.take_profit_percent;

        let admission = inner
            .tracker
            .admit(ticker, cap, settings.allow_averaging, |averaged| {
                if !self.is_running() {
                    return Err(GatewayError::Unavailable(
                        "strategy is not running".to_string(),
                    ));
                }
                take_profit = signals::take_profit(
                    settings.take_profit_percent,
                    averaged,
                    settings.allow_averaging,
                );
                inner.collaborators.gateway.submit_sell_limit(SellLimitOrder {
                    ticker: ticker.to_string(),
                    price,
                    take_profit_percent: take_profit,
                    quantity: 1,
                    lifetime: settings.order_lifetime(),
                })
            });

        match admission {
            Admission::Admitted {
                in_flight,
                averaged,
                ..
            } => {
                candidate.reference_price = tick.close;
                candidate.status = PurchaseStatus::OrderPlaced;

                let event = TriggerEvent {
                    ticker: ticker.to_string(),
                    reference_before: reference,
                    close: tick.close,
                    change_percent: change,
                    threshold_percent: threshold,
                    sell_price: price,
                    buyback_price: signals::buyback_price(price, take_profit, increment),
                    take_profit_percent: take_profit,
                    in_flight,
                    cap,
                    averaged,
                };
                inner
                    .collaborators
                    .events
                    .publish(StrategyEvent::OrderTriggered(event.clone()));
                TickOutcome::Triggered(event)
            }
            Admission::Rejected(AdmitRejection::CapReached { in_flight, cap }) => {
                TickOutcome::Rejected(Rejection::CapReached { in_flight, cap })
            }
            Admission::Rejected(AdmitRejection::AlreadyInFlight) => {
                TickOutcome::Rejected(Rejection::AlreadyInFlight)
            }
            Admission::Failed(e) => {
                if !self.is_running() {
                    return TickOutcome::Ignored(IgnoreReason::NotRunning);
                }
                tracing::error!(ticker = %ticker, error = %e, "Sell limit submission failed");
                inner
                    .collaborators
                    .events
                    .publish(StrategyEvent::SubmissionFailed {
                        ticker: ticker.to_string(),
                        reason: e.to_string(),
                    });
                TickOutcome::SubmissionFailed(e)
            }
        }
    }

    /// Reclaim completed orders and settle their candidates' status
    pub fn sweep_completed(&self) -> usize {
        let reclaimed = self.inner.tracker.sweep();
        if reclaimed.is_empty() {
            return 0;
        }

        for handle in &reclaimed {
            if self.inner.tracker.contains(handle.ticker()) {
                continue;
            }
            if let Some(slot) = self.slot(handle.ticker()) {
                slot.candidate.lock().status = match handle.state() {
                    OrderState::Filled => PurchaseStatus::Filled,
                    _ => PurchaseStatus::Waiting,
                };
            }
        }

        reclaimed.len()
    }

    pub fn status(&self) -> StrategyStatus {
        let settings = &self.inner.settings;
        let state = self.state();
        StrategyStatus {
            phase: state.phase,
            in_flight: self.in_flight(),
            cap: settings.purchase_parts,
            per_part_capital: settings.per_part_capital(),
            threshold_percent: state.basic_threshold_percent,
            take_profit_percent: settings.take_profit_percent,
            approximation_factor: settings.approximation_factor,
            min_tick_volume: settings.min_tick_volume,
            candidates: self.slots().len(),
        }
    }

    /// Candidates with a baseline, sorted by their move from it
    pub fn candidate_changes(&self, descending: bool) -> Vec<CandidateChange> {
        let market = &self.inner.collaborators.market;
        let min_volume = self.inner.settings.min_tick_volume;

        let mut changes: Vec<CandidateChange> = self
            .candidates()
            .into_iter()
            .filter(|c| c.reference_price != 0.0)
            .filter_map(|c| {
                let instrument = market.instrument(&c.ticker)?;
                let price = instrument.qualified_price(min_volume);
                Some(CandidateChange {
                    change_percent: signals::change_percent(price, c.reference_price)
                        .unwrap_or(0.0),
                    last_volume: instrument.last_candle().map(|k| k.volume).unwrap_or(0),
                    ticker: c.ticker,
                    reference_price: c.reference_price,
                    price,
                    status: c.status,
                })
            })
            .collect();

        changes.sort_by(|a, b| a.change_percent.total_cmp(&b.change_percent));
        if descending {
            changes.reverse();
        }
        changes
    }

    fn spawn_periodic(
        &self,
        period: Duration,
        job: fn(&UmbrellaStrategy),
    ) -> Option<JoinHandle<()>> {
        if !self.inner.periodic_timers {
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No tokio runtime, periodic timer not armed");
                return None;
            }
        };
        let weak = Arc::downgrade(&self.inner);

        Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let strategy = UmbrellaStrategy { inner };
                if !strategy.is_running() {
                    break;
                }
                job(&strategy);
            }
        }))
    }

    fn spawn_countdown(&self, at: DateTime<Utc>) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No tokio runtime, scheduled start will not fire");
                return None;
            }
        };
        let weak = Arc::downgrade(&self.inner);

        Some(runtime.spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let strategy = UmbrellaStrategy { inner };
                if strategy.scheduled_start() != Some(at) {
                    break;
                }

                let remaining = at - Utc::now();
                if remaining <= chrono::Duration::zero() {
                    strategy.activate(true, Some(at));
                    break;
                }

                strategy.fix_baseline();
                let wait = schedule::countdown_refresh(remaining)
                    .min(remaining.to_std().unwrap_or_default());
                drop(strategy);

                tokio::time::sleep(wait).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperGateway;
    use crate::market::{InMemoryMarket, TickerSet};
    use crate::models::Currency;
    use crate::notify::ChannelSink;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        strategy: UmbrellaStrategy,
        market: Arc<InMemoryMarket>,
        gateway: Arc<PaperGateway>,
        portfolio: Arc<TickerSet>,
        events: UnboundedReceiver<StrategyEvent>,
    }

    fn settings() -> StrategySettings {
        StrategySettings {
            purchase_volume: 1000.0,
            purchase_parts: 10,
            change_percent: 5.0,
            take_profit_percent: 1.0,
            approximation_factor: 0.65,
            spike_protection: 0,
            min_tick_volume: 100,
            min_day_volume: 5000,
            ..Default::default()
        }
    }

    fn instrument(ticker: &str, price: f64) -> Instrument {
        let mut instrument = Instrument::new(ticker, Currency::Secondary, price);
        instrument.day_volume = 10_000;
        instrument
    }

    fn fixture(settings: StrategySettings, tickers: &[&str]) -> Fixture {
        fixture_with(settings, tickers, false)
    }

    fn fixture_with(settings: StrategySettings, tickers: &[&str], manual: bool) -> Fixture {
        let market = Arc::new(InMemoryMarket::with_instruments(
            tickers.iter().map(|t| instrument(t, 100.0)).collect(),
            90.0,
        ));
        let gateway = Arc::new(PaperGateway::new());
        let portfolio = Arc::new(TickerSet::new());
        let (sink, events) = ChannelSink::new();

        let collaborators = Collaborators {
            market: market.clone(),
            portfolio: portfolio.clone(),
            blacklist: Arc::new(TickerSet::new()),
            gateway: gateway.clone(),
            events: Arc::new(sink),
        };
        let strategy = if manual {
            UmbrellaStrategy::manual(settings, collaborators)
        } else {
            UmbrellaStrategy::new(settings, collaborators)
        }
        .unwrap();

        let selected = market.instruments();
        strategy.build_candidates(&selected).unwrap();

        Fixture {
            strategy,
            market,
            gateway,
            portfolio,
            events,
        }
    }

    fn tick(close: f64) -> Candle {
        Candle::new(Utc::now(), close, 500)
    }

    fn drain(events: &mut UnboundedReceiver<StrategyEvent>) -> Vec<StrategyEvent> {
        let mut all = Vec::new();
        while let Ok(event) = events.try_recv() {
            all.push(event);
        }
        all
    }

    #[test]
    fn test_start_fixes_baselines() {
        let mut f = fixture(settings(), &["AAPL", "TSLA"]);
        assert!(f.strategy.candidates().iter().all(|c| c.reference_price == 0.0));

        f.strategy.start(false);

        assert!(f.strategy.is_running());
        assert!(f
            .strategy
            .candidates()
            .iter()
            .all(|c| c.reference_price == 100.0));
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [StrategyEvent::Started {
                scheduled: false,
                candidates: 2
            }]
        ));
    }

    #[test]
    fn test_ticks_ignored_unless_running_and_in_scope() {
        let f = fixture(settings(), &["AAPL"]);
        assert_eq!(
            f.strategy.on_tick("AAPL", &tick(106.0)),
            TickOutcome::Ignored(IgnoreReason::NotRunning)
        );

        f.strategy.start(false);
        assert_eq!(
            f.strategy.on_tick("MSFT", &tick(106.0)),
            TickOutcome::Ignored(IgnoreReason::NotInScope)
        );
    }

    #[test]
    fn test_qualifying_tick_triggers_sell() {
        let mut f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);
        drain(&mut f.events);

        let outcome = f.strategy.on_tick("AAPL", &tick(106.0));
        let TickOutcome::Triggered(event) = outcome else {
            panic!("expected trigger, got {:?}", outcome);
        };

        assert_eq!(event.sell_price, 105.65);
        assert_eq!(event.reference_before, 100.0);
        assert_eq!(event.take_profit_percent, 1.0);
        assert_eq!(event.buyback_price, 104.59);
        assert_eq!((event.in_flight, event.cap), (1, 10));
        assert!(!event.averaged);

        assert_eq!(f.gateway.submitted(), 1);
        assert_eq!(f.gateway.orders()[0].quantity, 1);
        assert_eq!(f.strategy.in_flight(), 1);

        let candidate = &f.strategy.candidates()[0];
        assert_eq!(candidate.reference_price, 106.0);
        assert_eq!(candidate.status, PurchaseStatus::OrderPlaced);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [StrategyEvent::OrderTriggered(_)]
        ));
    }

    #[test]
    fn test_move_below_threshold_rejected() {
        let f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);

        let outcome = f.strategy.on_tick("AAPL", &tick(104.0));
        assert!(matches!(
            outcome,
            TickOutcome::Rejected(Rejection::BelowThreshold { .. })
        ));
        assert_eq!(f.strategy.in_flight(), 0);
        assert_eq!(f.gateway.submitted(), 0);
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);
    }

    #[test]
    fn test_full_table_stops_strategy() {
        let mut f = fixture(
            StrategySettings {
                purchase_parts: 1,
                ..settings()
            },
            &["AAPL", "TSLA"],
        );
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());

        let outcome = f.strategy.on_tick("TSLA", &tick(106.0));

        assert_eq!(
            outcome,
            TickOutcome::StrategyStopped {
                in_flight: 1,
                cap: 1
            }
        );
        assert_eq!(f.strategy.phase(), Phase::Idle);
        assert_eq!(f.gateway.submitted(), 1);
        // Stop cancels the order that filled the table
        assert_eq!(f.gateway.cancelled(), 1);
        assert!(f.strategy.tracked_orders().is_empty());

        let events = drain(&mut f.events);
        assert!(matches!(
            events.last(),
            Some(StrategyEvent::Stopped {
                reason: StopReason::CapReached { in_flight: 1, cap: 1 }
            })
        ));
    }

    #[test]
    fn test_in_flight_without_averaging_rejected() {
        let f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());

        // 112 is 5.66% above the new baseline of 106
        assert_eq!(
            f.strategy.on_tick("AAPL", &tick(112.0)),
            TickOutcome::Rejected(Rejection::AlreadyInFlight)
        );
        assert_eq!(f.gateway.submitted(), 1);
    }

    #[test]
    fn test_averaging_drops_take_profit() {
        let f = fixture(
            StrategySettings {
                allow_averaging: true,
                ..settings()
            },
            &["AAPL"],
        );
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());

        let TickOutcome::Triggered(event) = f.strategy.on_tick("AAPL", &tick(112.0)) else {
            panic!("expected averaging trigger");
        };
        assert!(event.averaged);
        assert_eq!(event.take_profit_percent, 0.0);
        assert_eq!(event.in_flight, 1);
        assert_eq!(f.strategy.tracked_orders()[0].1.len(), 2);
    }

    #[test]
    fn test_held_position_rejected_without_averaging() {
        let f = fixture(
            StrategySettings {
                exclude_held: false,
                ..settings()
            },
            &["AAPL"],
        );
        f.portfolio.insert("AAPL");
        f.strategy.start(false);

        assert_eq!(
            f.strategy.on_tick("AAPL", &tick(106.0)),
            TickOutcome::Rejected(Rejection::AlreadyHeld)
        );
    }

    #[test]
    fn test_spike_skips_and_rebaselines() {
        let mut f = fixture(
            StrategySettings {
                spike_protection: 3,
                ..settings()
            },
            &["AAPL"],
        );
        f.strategy.start(false);
        drain(&mut f.events);

        let now = Utc::now();
        f.market
            .push_candle("AAPL", Candle::new(now - ChronoDuration::minutes(2), 101.0, 500));
        f.market
            .push_candle("AAPL", Candle::new(now - ChronoDuration::minutes(1), 105.7, 500));
        let trigger = Candle::new(now, 106.0, 500);
        f.market.push_candle("AAPL", trigger.clone());

        let TickOutcome::SpikeSkipped(event) = f.strategy.on_tick("AAPL", &trigger) else {
            panic!("expected spike skip");
        };
        assert_eq!(event.spike_close, 105.7);
        assert_eq!(f.gateway.submitted(), 0);

        let candidate = &f.strategy.candidates()[0];
        assert_eq!(candidate.reference_price, 106.0);
        assert_eq!(candidate.status, PurchaseStatus::Skipped);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [StrategyEvent::SpikeSkipped(_)]
        ));
    }

    #[test]
    fn test_spike_window_confirmed_places_order() {
        let f = fixture(
            StrategySettings {
                spike_protection: 3,
                ..settings()
            },
            &["AAPL"],
        );
        f.strategy.start(false);

        let now = Utc::now();
        f.market
            .push_candle("AAPL", Candle::new(now - ChronoDuration::minutes(2), 101.0, 500));
        f.market
            .push_candle("AAPL", Candle::new(now - ChronoDuration::minutes(1), 102.0, 500));
        let trigger = Candle::new(now, 106.0, 500);
        f.market.push_candle("AAPL", trigger.clone());

        assert!(f.strategy.on_tick("AAPL", &trigger).is_triggered());
    }

    #[test]
    fn test_close_price_guard_blocks() {
        let f = fixture(
            StrategySettings {
                close_price_protection_percent: 10.0,
                ..settings()
            },
            &["AAPL"],
        );
        let mut aapl = instrument("AAPL", 100.0);
        aapl.close_prices.end_of_session = 100.0;
        f.market.upsert(aapl);
        f.strategy.start(false);

        // 105.65 <= 100 * 1.10
        assert!(matches!(
            f.strategy.on_tick("AAPL", &tick(106.0)),
            TickOutcome::GuardBlocked(GuardTrip::ClosePrice { .. })
        ));
        assert_eq!(f.gateway.submitted(), 0);
    }

    #[test]
    fn test_submission_failure_leaves_state_unchanged() {
        let mut f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);
        drain(&mut f.events);
        f.gateway.set_reject_submissions(true);

        let outcome = f.strategy.on_tick("AAPL", &tick(106.0));

        assert!(matches!(outcome, TickOutcome::SubmissionFailed(_)));
        assert_eq!(f.strategy.in_flight(), 0);
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [StrategyEvent::SubmissionFailed { .. }]
        ));

        // Re-evaluated on the next tick
        f.gateway.set_reject_submissions(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());
    }

    #[test]
    fn test_sweep_settles_status() {
        let f = fixture(settings(), &["AAPL", "TSLA"]);
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());
        assert!(f.strategy.on_tick("TSLA", &tick(106.0)).is_triggered());

        let later = Utc::now() + ChronoDuration::minutes(1);
        f.gateway.on_candle("AAPL", &Candle::new(later, 106.0, 100));
        let lifetime = f.strategy.settings().order_lifetime_seconds as i64;
        f.gateway
            .expire(Utc::now() + ChronoDuration::seconds(lifetime + 1));

        assert_eq!(f.strategy.sweep_completed(), 2);
        assert_eq!(f.strategy.in_flight(), 0);
        assert!(f.strategy.tracked_orders().is_empty());

        let candidates = f.strategy.candidates();
        assert_eq!(candidates[0].status, PurchaseStatus::Filled);
        assert_eq!(candidates[1].status, PurchaseStatus::Waiting);
    }

    #[test]
    fn test_stop_cancels_and_tolerates_failures() {
        let f = fixture(settings(), &["AAPL", "TSLA"]);
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());
        assert!(f.strategy.on_tick("TSLA", &tick(106.0)).is_triggered());

        f.gateway.set_fail_cancellations(true);
        f.strategy.stop();

        assert_eq!(f.strategy.phase(), Phase::Idle);
        assert!(f.strategy.tracked_orders().is_empty());
        assert_eq!(f.gateway.cancelled(), 0);
    }

    #[test]
    fn test_build_is_noop_while_running() {
        let f = fixture(settings(), &["AAPL", "TSLA"]);
        f.strategy.start(false);

        let only_aapl = vec![f.market.instrument("AAPL").unwrap()];
        let kept = f.strategy.build_candidates(&only_aapl).unwrap();

        assert_eq!(kept.len(), 2);
        assert_eq!(f.strategy.candidates().len(), 2);
    }

    #[test]
    fn test_adjust_threshold_reevaluates() {
        let f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);
        // 5.03% above the baseline: between 5.00 and 5.05
        f.market
            .push_candle("AAPL", Candle::new(Utc::now(), 105.03, 500));

        let raised = f.strategy.adjust_global_threshold(1);
        assert_eq!(raised.len(), 1);
        assert!(matches!(
            raised[0].1,
            TickOutcome::Rejected(Rejection::BelowThreshold { .. })
        ));
        assert!((f.strategy.candidates()[0].threshold_percent - 5.05).abs() < 1e-9);
        assert!((f.strategy.status().threshold_percent - 5.05).abs() < 1e-9);

        let lowered = f.strategy.adjust_global_threshold(-1);
        assert!(lowered[0].1.is_triggered());
        assert!(f.strategy.adjust_global_threshold(0).is_empty());
    }

    #[test]
    fn test_restart_with_new_threshold() {
        let f = fixture(settings(), &["AAPL"]);
        f.strategy.adjust_global_threshold(1);
        f.strategy.start(false);

        let built = f
            .strategy
            .restart(&f.market.instruments(), Some(2.0))
            .unwrap();

        assert_eq!(built[0].threshold_percent, 2.0);
        assert!(f.strategy.is_running());
        assert_eq!(f.strategy.status().threshold_percent, 2.0);
        assert!(f.strategy.on_tick("AAPL", &tick(103.0)).is_triggered());
    }

    #[test]
    fn test_status_and_changes() {
        let f = fixture(settings(), &["AAPL", "TSLA"]);
        assert!(f.strategy.candidate_changes(true).is_empty());

        f.strategy.start(false);
        f.market.push_candle("AAPL", Candle::new(Utc::now(), 103.0, 500));
        f.market.push_candle("TSLA", Candle::new(Utc::now(), 98.0, 500));

        let changes = f.strategy.candidate_changes(true);
        assert_eq!(changes[0].ticker, "AAPL");
        assert!((changes[0].change_percent - 3.0).abs() < 1e-9);
        assert_eq!(changes[1].last_volume, 500);
        assert_eq!(f.strategy.candidate_changes(false)[0].ticker, "TSLA");

        let status = f.strategy.status();
        assert_eq!(status.phase, Phase::Running);
        assert_eq!(status.cap, 10);
        assert_eq!(status.per_part_capital, 100.0);
        assert!(status.to_string().contains("in flight 0/10"));
    }

    #[test]
    fn test_schedule_rejects_bad_time() {
        let f = fixture(settings(), &["AAPL"]);
        let err = f.strategy.schedule_start("10:00", false).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(f.strategy.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_schedule_and_stop() {
        let mut f = fixture(settings(), &["AAPL"]);
        let at = f.strategy.schedule_start("23:59:59", true).unwrap();

        assert!(at > Utc::now());
        assert_eq!(f.strategy.scheduled_start(), Some(at));
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [StrategyEvent::Scheduled { .. }]
        ));

        f.strategy.stop();
        assert_eq!(f.strategy.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_sweep_timer_frees_capacity() {
        let f = fixture(settings(), &["AAPL"]);
        f.strategy.start(false);
        assert!(f.strategy.on_tick("AAPL", &tick(106.0)).is_triggered());

        let later = Utc::now() + ChronoDuration::minutes(1);
        f.gateway.on_candle("AAPL", &Candle::new(later, 110.0, 100));
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        assert!(f.strategy.tracked_orders().is_empty());
        assert_eq!(f.strategy.candidates()[0].status, PurchaseStatus::Filled);
        f.strategy.stop();
    }

    fn fast_reset() -> StrategySettings {
        StrategySettings {
            reset_interval_seconds: 1,
            ..settings()
        }
    }

    fn armed_timers(strategy: &UmbrellaStrategy) -> (bool, bool) {
        let timers = strategy.inner.timers.lock();
        (timers.reset.is_some(), timers.sweep.is_some())
    }

    #[test]
    fn test_nan_threshold_rejected_at_construction() {
        let settings = StrategySettings {
            change_percent: f64::NAN,
            ..settings()
        };
        let (sink, _events) = ChannelSink::new();
        let result = UmbrellaStrategy::new(
            settings,
            Collaborators {
                market: Arc::new(InMemoryMarket::new(90.0)),
                portfolio: Arc::new(TickerSet::new()),
                blacklist: Arc::new(TickerSet::new()),
                gateway: Arc::new(PaperGateway::new()),
                events: Arc::new(sink),
            },
        );
        assert!(matches!(
            result,
            Err(StrategyError::InvalidSetting {
                field: "change_percent",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_countdown_starts_strategy() {
        let mut f = fixture(settings(), &["AAPL"]);
        let offset = schedule::exchange_offset(f.strategy.settings().exchange_utc_offset_hours)
            .unwrap();
        let target = (Utc::now() + ChronoDuration::seconds(2)).with_timezone(&offset);

        let at = f
            .strategy
            .schedule_start(&target.format("%H:%M:%S").to_string(), true)
            .unwrap();
        assert_eq!(f.strategy.scheduled_start(), Some(at));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !f.strategy.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        assert!(f.strategy.is_running());
        assert!(Utc::now() >= at);
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);
        assert!(drain(&mut f.events).iter().any(|e| matches!(
            e,
            StrategyEvent::Started {
                scheduled: true,
                ..
            }
        )));
        f.strategy.stop();
    }

    #[tokio::test]
    async fn test_reset_timer_refixes_baselines() {
        let f = fixture(fast_reset(), &["AAPL"]);
        f.strategy.start(false);
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);

        f.market.push_candle("AAPL", Candle::new(Utc::now(), 102.0, 500));
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        assert_eq!(f.strategy.candidates()[0].reference_price, 102.0);
        f.strategy.stop();
    }

    #[tokio::test]
    async fn test_stop_aborts_timers() {
        let f = fixture(fast_reset(), &["AAPL"]);
        f.strategy.start(false);
        assert_eq!(armed_timers(&f.strategy), (true, true));

        let handles = {
            let timers = f.strategy.inner.timers.lock();
            [timers.reset.as_ref(), timers.sweep.as_ref()]
                .into_iter()
                .flatten()
                .map(|h| h.abort_handle())
                .collect::<Vec<_>>()
        };

        f.strategy.stop();
        assert_eq!(armed_timers(&f.strategy), (false, false));

        f.market.push_candle("AAPL", Candle::new(Utc::now(), 102.0, 500));
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        assert!(handles.iter().all(|h| h.is_finished()));
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);
    }

    #[tokio::test]
    async fn test_manual_strategy_arms_no_periodic_timers() {
        let f = fixture_with(fast_reset(), &["AAPL"], true);
        f.strategy.start(false);
        assert!(f.strategy.is_running());
        assert_eq!(armed_timers(&f.strategy), (false, false));

        f.market.push_candle("AAPL", Candle::new(Utc::now(), 102.0, 500));
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(f.strategy.candidates()[0].reference_price, 100.0);

        f.strategy.fix_baseline();
        assert_eq!(f.strategy.candidates()[0].reference_price, 102.0);
        f.strategy.stop();
    }
}
