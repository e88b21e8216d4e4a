//! Structured strategy events and their sinks.
//!
//! The core only produces event payloads; rendering them for people is up
//! to whatever sink is registered.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum StopReason {
    Requested,
    /// Every part is in flight: the batch is complete
    CapReached { in_flight: usize, cap: usize },
    Restart,
}

/// A sell that was not placed because the move already spiked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpikeEvent {
    pub ticker: String,
    pub reference_before: f64,
    pub close: f64,
    pub sell_price: f64,
    pub spike_close: f64,
}

/// A sell limit that was submitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub ticker: String,
    pub reference_before: f64,
    pub close: f64,
    pub change_percent: f64,
    pub threshold_percent: f64,
    pub sell_price: f64,
    pub buyback_price: f64,
    pub take_profit_percent: f64,
    pub in_flight: usize,
    pub cap: usize,
    pub averaged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StrategyEvent {
    Started {
        scheduled: bool,
        candidates: usize,
    },
    Stopped {
        reason: StopReason,
    },
    Scheduled {
        at: DateTime<Utc>,
    },
    SchedulingAnomaly {
        requested: String,
        delay_ms: i64,
    },
    SpikeSkipped(SpikeEvent),
    OrderTriggered(TriggerEvent),
    SubmissionFailed {
        ticker: String,
        reason: String,
    },
}

/// Receiver of strategy events
///
/// Called from tick evaluation, so implementations must return quickly.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: StrategyEvent);
}

/// Renders every event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: StrategyEvent) {
        match event {
            StrategyEvent::Started {
                scheduled,
                candidates,
            } => {
                tracing::info!(scheduled, candidates, "☂️ Strategy started");
            }
            StrategyEvent::Stopped { reason } => {
                tracing::info!(reason = ?reason, "⏹️ Strategy stopped");
            }
            StrategyEvent::Scheduled { at } => {
                tracing::info!(at = %at, "⏰ Strategy start scheduled");
            }
            StrategyEvent::SchedulingAnomaly {
                requested,
                delay_ms,
            } => {
                tracing::warn!(
                    requested = %requested,
                    delay_ms,
                    "⚠️ Scheduled start is in the past"
                );
            }
            StrategyEvent::SpikeSkipped(e) => {
                tracing::info!(
                    ticker = %e.ticker,
                    reference = e.reference_before,
                    close = e.close,
                    sell_price = e.sell_price,
                    spike_close = e.spike_close,
                    "🚫 Spike skipped, baseline moved"
                );
            }
            StrategyEvent::OrderTriggered(e) => {
                tracing::info!(
                    ticker = %e.ticker,
                    reference = e.reference_before,
                    close = e.close,
                    change = %format!("{:.2}%", e.change_percent),
                    sell_price = e.sell_price,
                    buyback = e.buyback_price,
                    take_profit = e.take_profit_percent,
                    occupancy = %format!("{}/{}", e.in_flight, e.cap),
                    averaged = e.averaged,
                    "🎯 Sell limit triggered"
                );
            }
            StrategyEvent::SubmissionFailed { ticker, reason } => {
                tracing::error!(ticker = %ticker, reason = %reason, "❌ Order submission failed");
            }
        }
    }
}

/// Forwards events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StrategyEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StrategyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: StrategyEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.tx.send(event);
    }
}

/// Broadcasts events to every registered sink
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Vec<Box<dyn EventSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for SinkRegistry {
    fn publish(&self, event: StrategyEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
