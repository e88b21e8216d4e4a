use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("order rejected for {ticker}: {reason}")]
    Rejected { ticker: String, reason: String },

    #[error("order {0} is unknown to the gateway")]
    UnknownOrder(Uuid),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Sell-limit instruction handed to the execution gateway
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SellLimitOrder {
    pub ticker: String,
    pub price: f64,
    pub take_profit_percent: f64,
    pub quantity: u32,
    pub lifetime: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum OrderState {
    Active = 0,
    Filled = 1,
    Cancelled = 2,
    Expired = 3,
    Failed = 4,
}

impl OrderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OrderState::Active,
            1 => OrderState::Filled,
            2 => OrderState::Cancelled,
            3 => OrderState::Expired,
            _ => OrderState::Failed,
        }
    }
}

/// Cancellable handle to an in-flight order task
///
/// Completion is a polled state shared between the gateway (which
/// completes it) and the order tracker (which reads it during sweeps).
#[derive(Clone)]
pub struct OrderHandle {
    id: Uuid,
    ticker: String,
    state: Arc<AtomicU8>,
}

impl OrderHandle {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            state: Arc::new(AtomicU8::new(OrderState::Active as u8)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn state(&self) -> OrderState {
        OrderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == OrderState::Active
    }

    /// Move an active handle to a terminal state
    ///
    /// Returns false if the handle had already completed; the first
    /// completion wins.
    pub fn complete(&self, outcome: OrderState) -> bool {
        if outcome == OrderState::Active {
            return false;
        }
        self.state
            .compare_exchange(
                OrderState::Active as u8,
                outcome as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderHandle")
            .field("id", &self.id)
            .field("ticker", &self.ticker)
            .field("state", &self.state())
            .finish()
    }
}

/// Order placement collaborator
///
/// Both calls return immediately: a submission hands back a handle (or
/// fails at once), and the gateway completes the handle later.
pub trait ExecutionGateway: Send + Sync {
    fn submit_sell_limit(&self, order: SellLimitOrder) -> Result<OrderHandle, GatewayError>;

    fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_active() {
        let handle = OrderHandle::new("AAPL");
        assert!(handle.is_active());
        assert_eq!(handle.ticker(), "AAPL");
    }

    #[test]
    fn test_first_completion_wins() {
        let handle = OrderHandle::new("AAPL");
        let observer = handle.clone();

        assert!(handle.complete(OrderState::Filled));
        assert!(!handle.complete(OrderState::Cancelled));

        // Clones share state
        assert_eq!(observer.state(), OrderState::Filled);
        assert!(!observer.is_active());
    }

    #[test]
    fn test_complete_with_active_is_noop() {
        let handle = OrderHandle::new("AAPL");
        assert!(!handle.complete(OrderState::Active));
        assert!(handle.is_active());
    }
}
