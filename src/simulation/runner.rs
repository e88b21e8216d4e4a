use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::synthetic::{MarketScenario, SyntheticMarket};
use crate::config::StrategySettings;
use crate::discovery::UniverseFilter;
use crate::error::{Result, StrategyError};
use crate::execution::PaperGateway;
use crate::market::{InMemoryMarket, MarketData, TickerSet};
use crate::models::Candle;
use crate::notify::{ChannelSink, EventSink, SinkRegistry, StopReason, StrategyEvent};
use crate::strategy::{Collaborators, TickOutcome, UmbrellaStrategy};

/// Exchange rate used to size primary-currency instruments
const SIMULATED_EXCHANGE_RATE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub instruments: usize,
    /// Simulated session length, one candle per instrument per minute
    pub minutes: usize,
    pub scenario: MarketScenario,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            instruments: 8,
            minutes: 240,
            scenario: MarketScenario::Rally,
        }
    }
}

/// Tally of one simulated session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationReport {
    pub minutes_run: usize,
    pub ticks: usize,
    pub triggered: usize,
    pub spikes_skipped: usize,
    pub guard_blocked: usize,
    pub rejected: usize,
    pub submission_failures: usize,
    pub orders_filled: usize,
    pub orders_expired: usize,
    /// Session ended early because every part was in flight
    pub stopped_on_cap: bool,
    pub events: usize,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Minutes run:         {}", self.minutes_run)?;
        writeln!(f, "Ticks evaluated:     {}", self.ticks)?;
        writeln!(f, "Orders triggered:    {}", self.triggered)?;
        writeln!(f, "Orders filled:       {}", self.orders_filled)?;
        writeln!(f, "Orders expired:      {}", self.orders_expired)?;
        writeln!(f, "Spikes skipped:      {}", self.spikes_skipped)?;
        writeln!(f, "Guard blocks:        {}", self.guard_blocked)?;
        writeln!(f, "Rejected ticks:      {}", self.rejected)?;
        writeln!(f, "Submission failures: {}", self.submission_failures)?;
        write!(f, "Stopped on cap:      {}", self.stopped_on_cap)
    }
}

/// Replays a synthetic session through the strategy against a paper gateway
pub struct SimulationRunner {
    settings: StrategySettings,
}

impl SimulationRunner {
    pub fn new(settings: StrategySettings) -> Self {
        Self { settings }
    }

    /// Run a session
    ///
    /// Every minute each instrument gets one candle, the gateway matches
    /// resting orders against it, then the strategy evaluates it. Finished
    /// orders are swept and expired once per simulated minute; baselines are
    /// re-fixed every reset interval of simulated time.
    pub fn run(
        &self,
        config: &SimulationConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<SimulationReport> {
        let start = Utc::now();
        let mut generator = SyntheticMarket::new(config.seed);
        let instruments = generator.instruments(
            config.instruments,
            self.settings.price_min,
            self.settings.price_max,
        );

        let streams: Vec<(String, Vec<Candle>)> = instruments
            .iter()
            .map(|i| {
                let candles = generator.candles(config.scenario, i.price, config.minutes, start);
                (i.ticker.clone(), candles)
            })
            .collect();

        let market = Arc::new(InMemoryMarket::with_instruments(
            instruments,
            SIMULATED_EXCHANGE_RATE,
        ));
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_time(start);

        let (counter, mut rx) = ChannelSink::new();
        let mut events = SinkRegistry::new();
        events.register(Box::new(counter));
        events.register(Box::new(ForwardSink(sink)));

        // The loop below drives resets and sweeps on simulated time
        let strategy = UmbrellaStrategy::manual(
            self.settings.clone(),
            Collaborators {
                market: market.clone(),
                portfolio: Arc::new(TickerSet::new()),
                blacklist: Arc::new(TickerSet::new()),
                gateway: gateway.clone(),
                events: Arc::new(events),
            },
        )?;

        let universe = UniverseFilter::from_settings(&self.settings).apply(&market.instruments());
        strategy.build_candidates(&universe)?;
        strategy.start(false);

        tracing::info!(
            seed = config.seed,
            scenario = ?config.scenario,
            candidates = universe.len(),
            minutes = config.minutes,
            "🧪 Simulation started"
        );

        let reset_minutes = (self.settings.reset_interval_seconds / 60).max(1) as usize;
        let mut report = SimulationReport::default();

        'session: for minute in 0..config.minutes {
            let now: DateTime<Utc> = start + Duration::minutes(minute as i64);
            gateway.set_time(now);

            for (ticker, candles) in &streams {
                let candle = &candles[minute];
                if let Err(e) = feed(&market, ticker, candle) {
                    strategy.stop();
                    return Err(e);
                }
                gateway.on_candle(ticker, candle);

                let outcome = strategy.on_tick(ticker, candle);
                report.ticks += 1;
                if record(&mut report, &outcome) {
                    report.minutes_run = minute + 1;
                    break 'session;
                }
            }

            gateway.expire(now + Duration::seconds(59));
            strategy.sweep_completed();
            if (minute + 1) % reset_minutes == 0 {
                strategy.fix_baseline();
            }
            report.minutes_run = minute + 1;
        }

        strategy.stop();
        report.orders_filled = gateway.filled();
        report.orders_expired = gateway.expired();

        let mut by_kind: HashMap<&'static str, usize> = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                StrategyEvent::Stopped {
                    reason: StopReason::CapReached { .. }
                }
            ) {
                report.stopped_on_cap = true;
            }
            *by_kind.entry(event_kind(&event)).or_default() += 1;
            report.events += 1;
        }

        tracing::info!(
            triggered = report.triggered,
            filled = report.orders_filled,
            events = ?by_kind,
            "🏁 Simulation finished"
        );
        Ok(report)
    }
}

fn feed(market: &InMemoryMarket, ticker: &str, candle: &Candle) -> Result<()> {
    market
        .push_candle(ticker, candle.clone())
        .map(|_| ())
        .ok_or_else(|| StrategyError::DataUnavailable(ticker.to_string()))
}

/// Count one outcome; true once the strategy has stopped itself
fn record(report: &mut SimulationReport, outcome: &TickOutcome) -> bool {
    match outcome {
        TickOutcome::Triggered(_) => report.triggered += 1,
        TickOutcome::SpikeSkipped(_) => report.spikes_skipped += 1,
        TickOutcome::GuardBlocked(_) => report.guard_blocked += 1,
        TickOutcome::Rejected(_) => report.rejected += 1,
        TickOutcome::SubmissionFailed(_) => report.submission_failures += 1,
        TickOutcome::StrategyStopped { .. } => return true,
        TickOutcome::Ignored(_) => {}
    }
    false
}

fn event_kind(event: &StrategyEvent) -> &'static str {
    match event {
        StrategyEvent::Started { .. } => "started",
        StrategyEvent::Stopped { .. } => "stopped",
        StrategyEvent::Scheduled { .. } => "scheduled",
        StrategyEvent::SchedulingAnomaly { .. } => "scheduling_anomaly",
        StrategyEvent::SpikeSkipped(_) => "spike_skipped",
        StrategyEvent::OrderTriggered(_) => "order_triggered",
        StrategyEvent::SubmissionFailed { .. } => "submission_failed",
    }
}

struct ForwardSink(Arc<dyn EventSink>);

impl EventSink for ForwardSink {
    fn publish(&self, event: StrategyEvent) {
        self.0.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingSink;

    fn settings() -> StrategySettings {
        StrategySettings {
            purchase_volume: 10_000.0,
            purchase_parts: 4,
            min_tick_volume: 100,
            min_day_volume: 1_000,
            ..StrategySettings::default()
        }
    }

    #[test]
    fn test_rally_triggers_until_cap() {
        let runner = SimulationRunner::new(settings());
        let config = SimulationConfig {
            seed: 42,
            instruments: 6,
            minutes: 120,
            scenario: MarketScenario::Rally,
        };

        let report = runner.run(&config, Arc::new(TracingSink)).unwrap();

        assert!(report.triggered > 0, "Rally should trigger: {:?}", report);
        assert!(report.triggered <= report.ticks);
        assert!(report.events >= 2, "Expected start and stop events");
    }

    #[test]
    fn test_same_seed_same_report() {
        let runner = SimulationRunner::new(settings());
        let config = SimulationConfig {
            scenario: MarketScenario::Volatile,
            minutes: 60,
            ..SimulationConfig::default()
        };

        let a = runner.run(&config, Arc::new(TracingSink)).unwrap();
        let b = runner.run(&config, Arc::new(TracingSink)).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_inside_runtime_matches_plain_run() {
        let runner = SimulationRunner::new(settings());
        let config = SimulationConfig {
            minutes: 30,
            ..SimulationConfig::default()
        };

        let plain = std::thread::scope(|s| {
            s.spawn(|| runner.run(&config, Arc::new(TracingSink)))
                .join()
                .unwrap()
        })
        .unwrap();
        let inside = runner.run(&config, Arc::new(TracingSink)).unwrap();
        assert_eq!(plain, inside);
    }

    #[test]
    fn test_feed_unknown_ticker() {
        let market = InMemoryMarket::new(SIMULATED_EXCHANGE_RATE);
        let candle = Candle::new(Utc::now(), 100.0, 500);

        let result = feed(&market, "NOPE", &candle);
        assert!(matches!(result, Err(StrategyError::DataUnavailable(t)) if t == "NOPE"));
    }

    #[test]
    fn test_no_instruments_runs_empty() {
        let runner = SimulationRunner::new(settings());
        let config = SimulationConfig {
            instruments: 0,
            ..SimulationConfig::default()
        };

        let report = runner.run(&config, Arc::new(TracingSink)).unwrap();
        assert_eq!(report.ticks, 0);
        assert_eq!(report.triggered, 0);
        assert!(!report.stopped_on_cap);
    }
}
